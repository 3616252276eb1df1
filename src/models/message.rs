use serde::{Deserialize, Serialize};

/// An outgoing record for the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// A record fetched from a topic, acknowledged through the reader it came
/// from.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub source_topic: String,
    pub original_payload: String,
    pub failure_reason: String,
    pub failed_at: String,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}
