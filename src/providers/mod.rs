//! Delivery providers: the outbound side of the worker. One call per
//! delivery attempt; an `Err` counts as a failed attempt.

pub mod fcm;
pub mod http;
pub mod log;

use std::sync::Arc;

use anyhow::{Error, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::{config::Config, models::notification::Channel};

pub use fcm::FcmProvider;
pub use http::HttpGatewayProvider;
pub use log::LogProvider;

#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    async fn send(&self, id: Uuid, recipient: &str, content: &str) -> Result<(), Error>;

    fn name(&self) -> &'static str;
}

/// Picks the provider for `channel`, falling back to logging when the
/// channel's gateway is not configured.
pub fn build_provider(channel: Channel, config: &Config) -> Arc<dyn DeliveryProvider> {
    let retry = config.retry_config();

    match channel {
        Channel::Sms => match &config.sms_gateway_url {
            Some(url) => Arc::new(HttpGatewayProvider::new("sms_gateway", url.clone(), retry)),
            None => Arc::new(LogProvider::new(channel)),
        },
        Channel::Email => match &config.email_gateway_url {
            Some(url) => Arc::new(HttpGatewayProvider::new("email_gateway", url.clone(), retry)),
            None => Arc::new(LogProvider::new(channel)),
        },
        Channel::Push => match &config.fcm_project_id {
            Some(project_id) => Arc::new(FcmProvider::new(project_id.clone(), retry)),
            None => Arc::new(LogProvider::new(channel)),
        },
    }
}
