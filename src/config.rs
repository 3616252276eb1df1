use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;
use tokio::time::Duration;

use crate::{
    models::{notification::Channel, retry::RetryConfig},
    services::outbox::PublisherConfig,
    worker::WorkerConfig,
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    pub rabbitmq_url: String,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_outbox_poll_interval_ms")]
    pub outbox_poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub outbox_batch_size: i64,
    #[serde(default = "default_outbox_stale_after_secs")]
    pub outbox_stale_after_secs: u64,

    #[serde(default = "default_worker_channel")]
    pub worker_channel: String,
    #[serde(default = "default_batch_size")]
    pub worker_batch_size: i64,
    #[serde(default = "default_worker_fetch_timeout_ms")]
    pub worker_fetch_timeout_ms: u64,
    #[serde(default = "default_worker_idle_sleep_ms")]
    pub worker_idle_sleep_ms: u64,
    #[serde(default = "default_worker_rate_limit")]
    pub worker_rate_limit: u32,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_worker_shutdown_timeout_ms")]
    pub worker_shutdown_timeout_ms: u64,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    pub sms_gateway_url: Option<String>,
    pub email_gateway_url: Option<String>,
    pub fcm_project_id: Option<String>,

    #[serde(default)]
    pub log_format: Option<String>,
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_server_port() -> u16 {
    8080
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_outbox_poll_interval_ms() -> u64 {
    200
}

fn default_batch_size() -> i64 {
    100
}

fn default_outbox_stale_after_secs() -> u64 {
    300
}

fn default_worker_channel() -> String {
    "sms".to_string()
}

fn default_worker_fetch_timeout_ms() -> u64 {
    10
}

fn default_worker_idle_sleep_ms() -> u64 {
    50
}

fn default_worker_rate_limit() -> u32 {
    100
}

fn default_worker_concurrency() -> usize {
    100
}

fn default_worker_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    100
}

fn default_max_retry_delay_ms() -> u64 {
    2000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            poll_interval: Duration::from_millis(self.outbox_poll_interval_ms),
            batch_size: self.outbox_batch_size,
            stale_after: (self.outbox_stale_after_secs > 0)
                .then(|| Duration::from_secs(self.outbox_stale_after_secs)),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: usize::try_from(self.worker_batch_size.max(1)).unwrap_or(1),
            fetch_timeout: Duration::from_millis(self.worker_fetch_timeout_ms),
            idle_sleep: Duration::from_millis(self.worker_idle_sleep_ms),
            rate_limit: self.worker_rate_limit,
            concurrency: self.worker_concurrency.max(1),
            shutdown_timeout: Duration::from_millis(self.worker_shutdown_timeout_ms),
            retry: self.retry_config(),
        }
    }

    pub fn worker_channel(&self) -> Result<Channel, Error> {
        self.worker_channel
            .parse::<Channel>()
            .map_err(|e| anyhow!("Invalid WORKER_CHANNEL: {}", e))
    }

    pub fn json_logs(&self) -> bool {
        self.log_format
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, envy::Error> {
        envy::from_iter(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    #[test]
    fn defaults_apply_to_optional_settings() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/notifications"),
            ("RABBITMQ_URL", "amqp://localhost:5672"),
        ])
        .unwrap();

        assert_eq!(config.server_port, 8080);
        assert_eq!(config.outbox_batch_size, 100);
        assert_eq!(config.worker_channel().unwrap(), Channel::Sms);
        assert!(!config.json_logs());

        let worker = config.worker_config();
        assert_eq!(worker.batch_size, 100);
        assert_eq!(worker.fetch_timeout, Duration::from_millis(10));
        assert_eq!(worker.idle_sleep, Duration::from_millis(50));

        let publisher = config.publisher_config();
        assert_eq!(publisher.poll_interval, Duration::from_millis(200));
        assert_eq!(publisher.stale_after, Some(Duration::from_secs(300)));
    }

    #[test]
    fn zero_stale_age_disables_requeue() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/notifications"),
            ("RABBITMQ_URL", "amqp://localhost:5672"),
            ("OUTBOX_STALE_AFTER_SECS", "0"),
            ("WORKER_CHANNEL", "PUSH"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(config.publisher_config().stale_after, None);
        assert_eq!(config.worker_channel().unwrap(), Channel::Push);
        assert!(config.json_logs());
    }

    #[test]
    fn missing_database_url_is_rejected() {
        assert!(from_pairs(&[("RABBITMQ_URL", "amqp://localhost:5672")]).is_err());
    }
}
