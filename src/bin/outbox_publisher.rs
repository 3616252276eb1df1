use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use notification_pipeline::{
    api::{health_router, run_api_server},
    clients::{database::PostgresRepository, health::HealthChecker, rbmq::RabbitMqClient},
    config::Config,
    repository::NotificationRepository,
    services::outbox::OutboxPublisher,
    telemetry::init_tracing,
    utils::shutdown_signal,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

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

    let broker = Arc::new(RabbitMqClient::connect(&config.rabbitmq_url).await?);
    broker.declare_topology().await?;
    let writer = Arc::new(broker.writer().await?);

    let publisher = OutboxPublisher::new(Arc::clone(&repository), writer, config.publisher_config());

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown_signal().await;
            token.cancel();
        }
    });

    let health = HealthChecker::new(repository).with_broker(Arc::clone(&broker));
    let health_server = tokio::spawn(run_api_server(
        config.server_port,
        health_router(Arc::new(health)),
        token.clone(),
    ));

    publisher.run(token.clone()).await;

    token.cancel();
    match health_server.await {
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Outbox publisher exited");

    Ok(())
}
