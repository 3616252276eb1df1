//! Per-channel delivery worker.
//!
//! Each cycle fills a batch from the channel's three priority topics in
//! strict precedence, handles every message on its own task and joins the
//! batch before fetching again. A message is committed only once its outcome
//! is durable in the store; anything else is released or left uncommitted
//! for redelivery.

use std::{collections::HashMap, num::NonZeroU32, sync::Arc};

use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use tokio::{
    sync::Semaphore,
    task::JoinSet,
    time::{Duration, sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    broker::{MessageWriter, TopicReader, dead_letter_topic},
    models::{
        message::{BrokerMessage, Delivery, DlqMessage},
        notification::{Channel, Notification},
        outbox::OutboxEvent,
        retry::RetryConfig,
        status::{NotificationStatus, OutboxStatus},
    },
    providers::DeliveryProvider,
    repository::NotificationRepository,
    utils::retry_with_backoff,
};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub fetch_timeout: Duration,
    pub idle_sleep: Duration,
    /// Provider calls per second.
    pub rate_limit: u32,
    pub concurrency: usize,
    pub shutdown_timeout: Duration,
    /// Backoff for the store writes that settle a delivery.
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            fetch_timeout: Duration::from_millis(10),
            idle_sleep: Duration::from_millis(50),
            rate_limit: 100,
            concurrency: 100,
            shutdown_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

/// The three readers of one channel, all in the channel's consumer group.
#[derive(Clone)]
pub struct PriorityReaders {
    pub high: Arc<dyn TopicReader>,
    pub medium: Arc<dyn TopicReader>,
    pub low: Arc<dyn TopicReader>,
}

impl PriorityReaders {
    fn in_precedence(&self) -> [&Arc<dyn TopicReader>; 3] {
        [&self.high, &self.medium, &self.low]
    }
}

/// What the outbox row says about a received notification.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// The row is `published` and within the retry ceiling.
    Deliver(OutboxEvent),
    /// Nothing to do for this copy of the message.
    Skip(&'static str),
}

impl GateDecision {
    pub fn evaluate(event: Option<OutboxEvent>) -> Self {
        let Some(event) = event else {
            return Self::Skip("outbox event not found");
        };

        if event.is_exhausted() {
            return Self::Skip("retry ceiling exceeded");
        }

        match event.status {
            OutboxStatus::Published => Self::Deliver(event),
            OutboxStatus::Delivering => Self::Skip("event claimed by an in-flight delivery"),
            OutboxStatus::Sended => Self::Skip("event already delivered"),
            OutboxStatus::Pending => Self::Skip("event awaiting republish"),
            OutboxStatus::Failed => Self::Skip("event failed permanently"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Provider accepted the notification and the message was committed.
    Delivered,
    /// The gate declined the message and it was committed.
    Skipped,
    /// The payload could not be decoded and went to the dead-letter topic.
    DeadLettered,
    /// The provider failed; the event was rescheduled or failed.
    Failed,
    /// An infrastructure error left the message for redelivery.
    Released,
}

/// Handles one fetched message end to end.
pub struct MessageHandler {
    channel: Channel,
    repository: Arc<dyn NotificationRepository>,
    provider: Arc<dyn DeliveryProvider>,
    dead_letters: Arc<dyn MessageWriter>,
    limiter: DefaultDirectRateLimiter,
    retry: RetryConfig,
    /// Events claimed for delivery whose attempt has not settled yet, with
    /// the retry count they were claimed at.
    claimed: Mutex<HashMap<Uuid, i32>>,
}

impl MessageHandler {
    pub fn new(
        channel: Channel,
        repository: Arc<dyn NotificationRepository>,
        provider: Arc<dyn DeliveryProvider>,
        dead_letters: Arc<dyn MessageWriter>,
        rate_limit: u32,
        retry: RetryConfig,
    ) -> Result<Self, Error> {
        let per_second = NonZeroU32::new(rate_limit)
            .ok_or_else(|| anyhow!("Worker rate limit must be greater than zero"))?;

        Ok(Self {
            channel,
            repository,
            provider,
            dead_letters,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            retry,
            claimed: Mutex::new(HashMap::new()),
        })
    }

    pub async fn handle(&self, reader: &dyn TopicReader, delivery: Delivery) -> MessageOutcome {
        let notification = match serde_json::from_slice::<Notification>(&delivery.payload) {
            Ok(notification) => notification,
            Err(e) => return self.dead_letter(reader, &delivery, e.to_string()).await,
        };

        self.limiter.until_ready().await;

        let event = match self
            .repository
            .find_event_by_aggregate_id(notification.id)
            .await
        {
            Ok(event) => event,
            Err(e) => {
                warn!(id = %notification.id, error = %e, "Outbox lookup failed");
                return release(reader, &delivery).await;
            }
        };

        match GateDecision::evaluate(event) {
            GateDecision::Deliver(event) => {
                self.deliver(reader, &delivery, &notification, &event)
                    .await
            }
            GateDecision::Skip(reason) => {
                // Notification left as is: a claimed or sended row belongs to
                // another attempt, and an exhausted one must not become sended.
                debug!(id = %notification.id, topic = %delivery.topic, reason, "Skipping message");
                commit(reader, &delivery).await;
                MessageOutcome::Skipped
            }
        }
    }

    async fn deliver(
        &self,
        reader: &dyn TopicReader,
        delivery: &Delivery,
        notification: &Notification,
        event: &OutboxEvent,
    ) -> MessageOutcome {
        match self
            .repository
            .claim_event_for_delivery(notification.id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(id = %notification.id, "Delivery claimed by another handler");
                commit(reader, delivery).await;
                return MessageOutcome::Skipped;
            }
            Err(e) => {
                warn!(id = %notification.id, error = %e, "Failed to claim event for delivery");
                return release(reader, delivery).await;
            }
        }

        self.claimed.lock().insert(notification.id, event.retry_count);
        let outcome = self.attempt(reader, delivery, notification, event).await;
        self.claimed.lock().remove(&notification.id);

        outcome
    }

    /// Runs one provider attempt for an event this handler has claimed.
    async fn attempt(
        &self,
        reader: &dyn TopicReader,
        delivery: &Delivery,
        notification: &Notification,
        event: &OutboxEvent,
    ) -> MessageOutcome {
        if let Err(e) = self
            .repository
            .update_notification_status(notification.id, NotificationStatus::Processing)
            .await
        {
            warn!(id = %notification.id, error = %e, "Failed to mark notification processing");
            self.persist_event(notification, OutboxStatus::Published, event.retry_count)
                .await;
            return release(reader, delivery).await;
        }

        if let Err(e) = self
            .provider
            .send(notification.id, &notification.recipient, &notification.content)
            .await
        {
            let (status, retry_count) = event.after_failure();
            warn!(
                id = %notification.id,
                provider = self.provider.name(),
                retry_count,
                status = %status,
                error = %e,
                "Delivery attempt failed"
            );

            self.persist_event(notification, status, retry_count).await;
            release(reader, delivery).await;
            return MessageOutcome::Failed;
        }

        if self
            .set_notification_status(notification, NotificationStatus::Sended)
            .await
            .is_err()
        {
            return release(reader, delivery).await;
        }

        self.persist_event(notification, OutboxStatus::Sended, event.retry_count)
            .await;

        info!(
            id = %notification.id,
            channel = %self.channel,
            provider = self.provider.name(),
            topic = %delivery.topic,
            "Notification delivered"
        );

        commit(reader, delivery).await;
        MessageOutcome::Delivered
    }

    /// Hands every claim whose task was aborted mid-attempt back to
    /// `published`, so a redelivered copy can pass the gate again.
    pub async fn release_abandoned_claims(&self) {
        let abandoned: Vec<(Uuid, i32)> = self.claimed.lock().drain().collect();

        for (id, retry_count) in abandoned {
            match self
                .repository
                .update_event_status(id, OutboxStatus::Published, retry_count)
                .await
            {
                Ok(()) => info!(id = %id, "Released abandoned delivery claim"),
                Err(e) => error!(id = %id, error = %e, "Failed to release abandoned delivery claim"),
            }
        }
    }

    async fn set_notification_status(
        &self,
        notification: &Notification,
        status: NotificationStatus,
    ) -> Result<(), Error> {
        retry_with_backoff(&self.retry, || {
            self.repository
                .update_notification_status(notification.id, status)
        })
        .await
        .inspect_err(|e| {
            error!(id = %notification.id, status = %status, error = %e, "Failed to update notification status")
        })
    }

    async fn persist_event(&self, notification: &Notification, status: OutboxStatus, retry_count: i32) {
        let result = retry_with_backoff(&self.retry, || {
            self.repository
                .update_event_status(notification.id, status, retry_count)
        })
        .await;

        if let Err(e) = result {
            error!(
                id = %notification.id,
                status = %status,
                retry_count,
                error = %e,
                "Failed to persist outbox event status"
            );
        }
    }

    async fn dead_letter(
        &self,
        reader: &dyn TopicReader,
        delivery: &Delivery,
        reason: String,
    ) -> MessageOutcome {
        let dlq_message = DlqMessage {
            source_topic: delivery.topic.clone(),
            original_payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
            failure_reason: reason,
            failed_at: Utc::now().to_rfc3339(),
        };

        let written = match serde_json::to_vec(&dlq_message) {
            Ok(payload) => {
                let message = BrokerMessage::new(dead_letter_topic(self.channel), payload);
                self.dead_letters.write_messages(vec![message]).await
            }
            Err(e) => Err(e.into()),
        };

        match written {
            Ok(()) => {
                warn!(
                    topic = %delivery.topic,
                    reason = %dlq_message.failure_reason,
                    "Undecodable message moved to dead-letter topic"
                );
                commit(reader, delivery).await;
                MessageOutcome::DeadLettered
            }
            Err(e) => {
                error!(topic = %delivery.topic, error = %e, "Failed to write dead letter");
                release(reader, delivery).await
            }
        }
    }
}

async fn commit(reader: &dyn TopicReader, delivery: &Delivery) {
    if let Err(e) = reader.commit(delivery).await {
        warn!(
            topic = %delivery.topic,
            delivery_tag = delivery.delivery_tag,
            error = %e,
            "Failed to commit message"
        );
    }
}

async fn release(reader: &dyn TopicReader, delivery: &Delivery) -> MessageOutcome {
    if let Err(e) = reader.release(delivery).await {
        warn!(
            topic = %delivery.topic,
            delivery_tag = delivery.delivery_tag,
            error = %e,
            "Failed to release message"
        );
    }
    MessageOutcome::Released
}

pub struct DeliveryWorker {
    channel: Channel,
    readers: PriorityReaders,
    handler: Arc<MessageHandler>,
    semaphore: Arc<Semaphore>,
    config: WorkerConfig,
}

impl DeliveryWorker {
    pub fn new(
        channel: Channel,
        readers: PriorityReaders,
        repository: Arc<dyn NotificationRepository>,
        provider: Arc<dyn DeliveryProvider>,
        dead_letters: Arc<dyn MessageWriter>,
        config: WorkerConfig,
    ) -> Result<Self, Error> {
        let handler = MessageHandler::new(
            channel,
            repository,
            provider,
            dead_letters,
            config.rate_limit,
            config.retry.clone(),
        )?;

        Ok(Self {
            channel,
            readers,
            handler: Arc::new(handler),
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
        })
    }

    pub async fn run(&self, token: CancellationToken) {
        info!(
            channel = %self.channel,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            rate_limit = self.config.rate_limit,
            "Delivery worker started"
        );

        while !token.is_cancelled() {
            if self.process_cycle(&token).await == 0 {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(self.config.idle_sleep) => {}
                }
            }
        }

        self.close_readers().await;

        info!(channel = %self.channel, "Delivery worker stopped");
    }

    /// Fetches one batch and handles it to completion. Returns the number of
    /// messages fetched.
    pub async fn process_cycle(&self, token: &CancellationToken) -> usize {
        let batch = self.fetch_batch().await;
        let fetched = batch.len();

        if fetched == 0 {
            return 0;
        }

        let mut tasks = JoinSet::new();
        for (reader, delivery) in batch {
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                break;
            };
            let handler = Arc::clone(&self.handler);

            tasks.spawn(async move {
                let _permit = permit;
                handler.handle(reader.as_ref(), delivery).await
            });
        }

        self.join_batch(tasks, token).await;

        fetched
    }

    /// Fills up to `batch_size` messages, draining `high` before `medium`
    /// and `medium` before `low`. Each fetch is bounded by `fetch_timeout`.
    pub async fn fetch_batch(&self) -> Vec<(Arc<dyn TopicReader>, Delivery)> {
        let mut batch = Vec::with_capacity(self.config.batch_size);

        for reader in self.readers.in_precedence() {
            while batch.len() < self.config.batch_size {
                match timeout(self.config.fetch_timeout, reader.fetch_message()).await {
                    Ok(Ok(Some(delivery))) => batch.push((Arc::clone(reader), delivery)),
                    Ok(Ok(None)) | Err(_) => break,
                    Ok(Err(e)) => {
                        warn!(topic = %reader.topic(), error = %e, "Fetch failed");
                        break;
                    }
                }
            }

            if batch.len() >= self.config.batch_size {
                break;
            }
        }

        batch
    }

    async fn join_batch(&self, mut tasks: JoinSet<MessageOutcome>, token: &CancellationToken) {
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(result) => log_joined(result),
                    None => return,
                },
                _ = token.cancelled() => break,
            }
        }

        info!(
            remaining = tasks.len(),
            timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
            "Draining in-flight messages"
        );

        let deadline = sleep(self.config.shutdown_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(result) => log_joined(result),
                    None => return,
                },
                _ = &mut deadline => {
                    warn!(remaining = tasks.len(), "Drain deadline reached, aborting in-flight messages");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    self.handler.release_abandoned_claims().await;
                    return;
                }
            }
        }
    }

    async fn close_readers(&self) {
        for reader in self.readers.in_precedence() {
            if let Err(e) = reader.close().await {
                warn!(topic = %reader.topic(), error = %e, "Failed to close reader");
            }
        }
    }
}

fn log_joined(result: Result<MessageOutcome, tokio::task::JoinError>) {
    match result {
        Ok(outcome) => debug!(outcome = ?outcome, "Message handled"),
        Err(e) => error!(error = %e, "Message task panicked"),
    }
}
