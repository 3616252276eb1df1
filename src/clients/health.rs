use std::{collections::BTreeMap, sync::Arc, time::Instant};

use tracing::{debug, warn};

use crate::{
    clients::rbmq::RabbitMqClient,
    models::health::{ComponentHealth, HealthCheckResponse},
    repository::NotificationRepository,
};

/// Probes the store and, for processes that hold one, the broker
/// connection.
pub struct HealthChecker {
    repository: Arc<dyn NotificationRepository>,
    broker: Option<Arc<RabbitMqClient>>,
}

impl HealthChecker {
    pub fn new(repository: Arc<dyn NotificationRepository>) -> Self {
        Self {
            repository,
            broker: None,
        }
    }

    pub fn with_broker(mut self, broker: Arc<RabbitMqClient>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = BTreeMap::new();

        checks.insert("database".to_string(), self.check_database().await);

        if let Some(broker) = &self.broker {
            checks.insert("message_broker".to_string(), check_broker(broker));
        }

        HealthCheckResponse::from_checks(checks)
    }

    async fn check_database(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.repository.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed();
                debug!(response_time_ms = elapsed.as_millis() as u64, "Database health check passed");
                ComponentHealth::up(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ComponentHealth::down(format!("Health check query failed: {}", e))
            }
        }
    }
}

fn check_broker(broker: &RabbitMqClient) -> ComponentHealth {
    let start = Instant::now();

    if broker.is_connected() {
        ComponentHealth::up(start.elapsed())
    } else {
        warn!("RabbitMQ connection is down");
        ComponentHealth::down("Connection lost")
    }
}
