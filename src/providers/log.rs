use anyhow::{Error, Result};
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::{models::notification::Channel, providers::DeliveryProvider};

/// Accepts every notification and only logs it. Stands in for a channel
/// whose gateway is not configured.
pub struct LogProvider {
    channel: Channel,
}

impl LogProvider {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl DeliveryProvider for LogProvider {
    async fn send(&self, id: Uuid, recipient: &str, content: &str) -> Result<(), Error> {
        info!(
            channel = %self.channel,
            id = %id,
            recipient,
            content_len = content.len(),
            "Notification delivered to log"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
