use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    broker::MessageWriter, models::message::BrokerMessage, repository::NotificationRepository,
};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Age after which an unconfirmed `published` row, or a `delivering`
    /// claim that never settled, is handed back to `pending`. `None`
    /// disables the requeue.
    pub stale_after: Option<Duration>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            batch_size: 100,
            stale_after: Some(Duration::from_secs(300)),
        }
    }
}

/// Moves pending outbox rows onto the broker.
pub struct OutboxPublisher {
    repository: Arc<dyn NotificationRepository>,
    writer: Arc<dyn MessageWriter>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        writer: Arc<dyn MessageWriter>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            repository,
            writer,
            config,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox publisher started"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.requeue_stale().await {
                warn!(error = %e, "Stale outbox requeue failed");
            }

            match self.run_cycle().await {
                Ok(0) => {}
                Ok(count) => debug!(count, "Outbox batch published"),
                Err(e) => error!(error = %e, "Outbox publish cycle failed"),
            }
        }

        info!("Outbox publisher stopped");
    }

    /// One claim/mark/publish pass. Returns the number of rows published.
    /// When the broker write fails the claimed rows go back to `pending`.
    pub async fn run_cycle(&self) -> Result<usize, Error> {
        let claim = self
            .repository
            .claim_pending_events(self.config.batch_size)
            .await?;

        if claim.events().is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = claim.events().iter().map(|e| e.id).collect();
        let messages: Vec<BrokerMessage> = claim
            .events()
            .iter()
            .map(|e| {
                BrokerMessage::new(e.topic.clone(), e.payload.clone())
                    .with_key(e.aggregate_id.to_string())
            })
            .collect();

        claim.mark_published().await?;

        if let Err(e) = self.writer.write_messages(messages).await {
            warn!(error = %e, count = ids.len(), "Broker write failed, reverting outbox rows");

            if let Err(revert) = self.repository.mark_pending(&ids).await {
                error!(error = %revert, count = ids.len(), "Failed to revert outbox rows to pending");
            }

            return Err(anyhow!("Failed to publish outbox batch: {}", e));
        }

        if let Err(e) = self.repository.confirm_published(&ids).await {
            warn!(error = %e, count = ids.len(), "Failed to record broker confirmation");
        }

        Ok(ids.len())
    }

    /// Returns rows whose publish was never confirmed, and delivery claims
    /// abandoned by a worker, to `pending` once they pass the stale age.
    pub async fn requeue_stale(&self) -> Result<u64, Error> {
        let Some(stale_after) = self.config.stale_after else {
            return Ok(0);
        };

        let older_than = Utc::now() - chrono::Duration::from_std(stale_after)?;

        let unconfirmed = self.repository.reset_stale_published(older_than).await?;
        if unconfirmed > 0 {
            warn!(count = unconfirmed, "Requeued unconfirmed published outbox rows");
        }

        let abandoned = self.repository.reset_stale_deliveries(older_than).await?;
        if abandoned > 0 {
            warn!(count = abandoned, "Settled abandoned delivery claims");
        }

        Ok(unconfirmed + abandoned)
    }
}
