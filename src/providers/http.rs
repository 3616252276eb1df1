use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{models::retry::RetryConfig, providers::DeliveryProvider, utils::retry_with_backoff};

#[derive(Debug, Clone, Serialize)]
struct GatewayRequest<'a> {
    id: Uuid,
    recipient: &'a str,
    content: &'a str,
}

/// Posts each notification as JSON to an SMS or email gateway.
pub struct HttpGatewayProvider {
    name: &'static str,
    http_client: Client,
    url: String,
    retry_config: RetryConfig,
}

impl HttpGatewayProvider {
    pub fn new(name: &'static str, url: String, retry_config: RetryConfig) -> Self {
        info!(provider = name, url = %url, "HTTP gateway provider initialized");

        Self {
            name,
            http_client: Client::new(),
            url,
            retry_config,
        }
    }

    async fn send_once(&self, request: &GatewayRequest<'_>) -> Result<(), Error> {
        let response = self
            .http_client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow!("{} request failed: {}", self.name, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let error_text = response.text().await.unwrap_or_default();
        Err(anyhow!(
            "{} rejected notification ({}): {}",
            self.name,
            status,
            error_text
        ))
    }
}

#[async_trait]
impl DeliveryProvider for HttpGatewayProvider {
    async fn send(&self, id: Uuid, recipient: &str, content: &str) -> Result<(), Error> {
        debug!(provider = self.name, id = %id, "Sending notification to gateway");

        let request = GatewayRequest {
            id,
            recipient,
            content,
        };

        retry_with_backoff(&self.retry_config, || self.send_once(&request)).await?;

        info!(provider = self.name, id = %id, "Gateway accepted notification");

        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
