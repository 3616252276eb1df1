use std::collections::HashMap;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    models::{
        fcm::{FcmMessage, FcmNotification, FcmRequest},
        retry::RetryConfig,
        validation::validate_fcm_token,
    },
    providers::DeliveryProvider,
    utils::retry_with_backoff,
};

const FCM_SCOPES: &[&str] = &["https://www.googleapis.com/auth/firebase.messaging"];
const PUSH_TITLE: &str = "Notification";

/// Push delivery over the FCM v1 API. The recipient is the device token.
pub struct FcmProvider {
    http_client: Client,
    fcm_project_id: String,
    retry_config: RetryConfig,
}

impl FcmProvider {
    pub fn new(fcm_project_id: String, retry_config: RetryConfig) -> Self {
        info!(project_id = %fcm_project_id, "FCM provider initialized");

        Self {
            http_client: Client::new(),
            fcm_project_id,
            retry_config,
        }
    }

    fn request(id: Uuid, device_token: &str, content: &str) -> FcmRequest {
        let data = HashMap::from([("notification_id".to_string(), id.to_string())]);

        FcmRequest {
            message: FcmMessage {
                token: device_token.to_string(),
                notification: FcmNotification {
                    title: PUSH_TITLE.to_string(),
                    body: content.to_string(),
                },
                data: Some(data),
            },
        }
    }

    async fn send_once(&self, request: &FcmRequest) -> Result<(), Error> {
        let provider = gcp_auth::provider().await?;
        let token = provider.token(FCM_SCOPES).await?;

        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.fcm_project_id
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(token.as_str())
            .json(request)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let error_text = response.text().await?;
            Err(anyhow!("FCM request failed: {}", error_text))
        }
    }
}

#[async_trait]
impl DeliveryProvider for FcmProvider {
    async fn send(&self, id: Uuid, recipient: &str, content: &str) -> Result<(), Error> {
        validate_fcm_token(recipient)?;

        debug!(id = %id, "Sending FCM push notification");

        let request = Self::request(id, recipient, content);
        retry_with_backoff(&self.retry_config, || self.send_once(&request)).await?;

        info!(id = %id, "FCM push notification sent successfully");

        Ok(())
    }

    fn name(&self) -> &'static str {
        "fcm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_token_fails_before_any_request() {
        let provider = FcmProvider::new("demo-project".to_string(), RetryConfig::default());
        let result = provider.send(Uuid::new_v4(), "short", "hello").await;

        assert!(result.is_err());
    }

    #[test]
    fn request_carries_notification_id() {
        let id = Uuid::new_v4();
        let request = FcmProvider::request(id, "token", "body");

        assert_eq!(request.message.notification.body, "body");
        assert_eq!(
            request.message.data.unwrap().get("notification_id"),
            Some(&id.to_string())
        );
    }
}
