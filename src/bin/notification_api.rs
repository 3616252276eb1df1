use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use notification_pipeline::{
    api::{AppState, build_router, run_api_server},
    clients::{database::PostgresRepository, health::HealthChecker},
    config::Config,
    repository::NotificationRepository,
    services::notification::NotificationService,
    telemetry::init_tracing,
    utils::shutdown_signal,
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.json_logs())?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let repository: Arc<dyn NotificationRepository> = Arc::new(
        PostgresRepository::connect(&config.database_url, config.database_max_connections).await?,
    );

    let state = AppState {
        notifications: NotificationService::new(Arc::clone(&repository)),
        health_checker: Arc::new(HealthChecker::new(repository)),
    };
    let app = build_router(state, Duration::from_millis(config.request_timeout_ms));

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown_signal().await;
            token.cancel();
        }
    });

    run_api_server(config.server_port, app, token).await?;

    info!("Notification API exited");

    Ok(())
}
