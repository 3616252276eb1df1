use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use notification_pipeline::{
    api::{health_router, run_api_server},
    broker::{consumer_group, topic_name},
    clients::{database::PostgresRepository, health::HealthChecker, rbmq::RabbitMqClient},
    config::Config,
    models::notification::Priority,
    providers::build_provider,
    repository::NotificationRepository,
    telemetry::init_tracing,
    utils::shutdown_signal,
    worker::{DeliveryWorker, PriorityReaders},
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

    let channel = config.worker_channel()?;
    let group = consumer_group(channel);

    let repository: Arc<dyn NotificationRepository> = Arc::new(
        PostgresRepository::connect(&config.database_url, config.database_max_connections).await?,
    );

    let broker = Arc::new(RabbitMqClient::connect(&config.rabbitmq_url).await?);
    broker.declare_topology().await?;

    let readers = PriorityReaders {
        high: Arc::new(broker.reader(&topic_name(channel, Priority::High), &group).await?),
        medium: Arc::new(broker.reader(&topic_name(channel, Priority::Medium), &group).await?),
        low: Arc::new(broker.reader(&topic_name(channel, Priority::Low), &group).await?),
    };
    let dead_letters = Arc::new(broker.writer().await?);
    let provider = build_provider(channel, &config);

    info!(channel = %channel, group = %group, provider = provider.name(), "Starting delivery worker");

    let worker = DeliveryWorker::new(
        channel,
        readers,
        Arc::clone(&repository),
        provider,
        dead_letters,
        config.worker_config(),
    )?;

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

    worker.run(token.clone()).await;

    token.cancel();
    match health_server.await {
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task failed"),
        Ok(Ok(())) => {}
    }

    info!(channel = %channel, "Delivery worker exited");

    Ok(())
}
