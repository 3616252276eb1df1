use anyhow::Result;
use notification_pipeline::{
    config::Config,
    models::notification::Channel,
    providers::{DeliveryProvider, HttpGatewayProvider, LogProvider, build_provider},
};
use serde_json::json;
use uuid::Uuid;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, method, path},
};

use crate::support::fast_retry;

/// Test: The gateway receives the notification id, recipient and content
#[tokio::test]
async fn test_http_gateway_posts_notification() -> Result<()> {
    let server = MockServer::start().await;
    let id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/send"))
        .and(body_partial_json(json!({
            "id": id,
            "recipient": "+15550001",
            "content": "your code is 1234",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let provider =
        HttpGatewayProvider::new("sms_gateway", format!("{}/send", server.uri()), fast_retry());

    provider.send(id, "+15550001", "your code is 1234").await?;
    assert_eq!(provider.name(), "sms_gateway");

    Ok(())
}

/// Test: Server errors are retried and then surfaced as a failed attempt
#[tokio::test]
async fn test_http_gateway_retries_server_errors() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("gateway down"))
        .expect(2)
        .mount(&server)
        .await;

    let provider = HttpGatewayProvider::new("email_gateway", server.uri(), fast_retry());

    let error = tokio_test::assert_err!(provider.send(Uuid::new_v4(), "a@b.co", "hello").await);
    assert!(error.to_string().contains("gateway down"));

    Ok(())
}

/// Test: A transient gateway failure recovers within the retry budget
#[tokio::test]
async fn test_http_gateway_recovers_after_transient_error() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let provider = HttpGatewayProvider::new("sms_gateway", server.uri(), fast_retry());

    tokio_test::assert_ok!(provider.send(Uuid::new_v4(), "+1555", "hi").await);

    Ok(())
}

/// Test: The log provider accepts everything
#[tokio::test]
async fn test_log_provider_always_succeeds() -> Result<()> {
    let provider = LogProvider::new(Channel::Email);

    provider.send(Uuid::new_v4(), "a@b.co", "hello").await?;
    assert_eq!(provider.name(), "log");

    Ok(())
}

/// Test: Channels without a configured gateway fall back to logging
#[tokio::test]
async fn test_build_provider_falls_back_to_log() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        (
            "DATABASE_URL".to_string(),
            "postgres://localhost/notifications".to_string(),
        ),
        (
            "RABBITMQ_URL".to_string(),
            "amqp://localhost:5672".to_string(),
        ),
        (
            "SMS_GATEWAY_URL".to_string(),
            "http://localhost:9000/sms".to_string(),
        ),
    ])?;

    assert_eq!(build_provider(Channel::Sms, &config).name(), "sms_gateway");
    assert_eq!(build_provider(Channel::Email, &config).name(), "log");
    assert_eq!(build_provider(Channel::Push, &config).name(), "log");

    Ok(())
}
