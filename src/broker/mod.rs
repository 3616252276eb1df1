//! Broker client contract.
//!
//! Topics are named `{channel}_{priority}`. A reader hands out one message
//! at a time and nothing is considered processed until the reader commits
//! it; released or uncommitted messages are redelivered.

pub mod memory;

use anyhow::{Error, Result};
use async_trait::async_trait;

use crate::models::{
    message::{BrokerMessage, Delivery},
    notification::{Channel, Priority},
};

pub use memory::InMemoryBroker;

pub fn topic_name(channel: Channel, priority: Priority) -> String {
    format!("{}_{}", channel, priority)
}

pub fn dead_letter_topic(channel: Channel) -> String {
    format!("{}_dlq", channel)
}

pub fn consumer_group(channel: Channel) -> String {
    format!("{}-worker-group", channel)
}

/// Every topic the pipeline writes to, dead-letter topics included.
pub fn all_topics() -> Vec<String> {
    Channel::ALL
        .iter()
        .flat_map(|channel| {
            Priority::ALL
                .iter()
                .map(|priority| topic_name(*channel, *priority))
                .chain(std::iter::once(dead_letter_topic(*channel)))
        })
        .collect()
}

#[async_trait]
pub trait MessageWriter: Send + Sync {
    /// Writes the whole batch. Succeeds only once the broker has confirmed
    /// every message.
    async fn write_messages(&self, messages: Vec<BrokerMessage>) -> Result<(), Error>;
}

#[async_trait]
pub trait TopicReader: Send + Sync {
    fn topic(&self) -> &str;

    /// Returns the next available message, or `None` when the topic is
    /// currently empty. Callers bound the wait with their own timeout.
    async fn fetch_message(&self) -> Result<Option<Delivery>, Error>;

    /// Acknowledges a message as durably processed.
    async fn commit(&self, delivery: &Delivery) -> Result<(), Error>;

    /// Hands a message back to the broker for redelivery.
    async fn release(&self, delivery: &Delivery) -> Result<(), Error>;

    /// Stops the reader. Messages neither committed nor released are
    /// redelivered to other readers of the topic.
    async fn close(&self) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_follow_channel_priority() {
        assert_eq!(topic_name(Channel::Sms, Priority::High), "sms_high");
        assert_eq!(topic_name(Channel::Push, Priority::Low), "push_low");
        assert_eq!(dead_letter_topic(Channel::Email), "email_dlq");
        assert_eq!(consumer_group(Channel::Email), "email-worker-group");
    }

    #[test]
    fn nine_priority_topics_plus_dead_letters() {
        let topics = all_topics();
        assert_eq!(topics.len(), 12);
        assert!(topics.contains(&"email_medium".to_string()));
        assert!(topics.contains(&"push_dlq".to_string()));
    }
}
