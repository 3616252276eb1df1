use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use notification_pipeline::{
    broker::{InMemoryBroker, topic_name},
    models::{
        notification::{Channel, NewNotification, Priority},
        retry::RetryConfig,
    },
    providers::DeliveryProvider,
    repository::InMemoryRepository,
    services::{
        notification::NotificationService,
        outbox::{OutboxPublisher, PublisherConfig},
    },
    worker::{DeliveryWorker, PriorityReaders, WorkerConfig},
};
use parking_lot::Mutex;
use tokio::time::{Duration, sleep};
use uuid::Uuid;

/// Provider double that records every call and fails on demand.
#[derive(Default)]
pub struct RecordingProvider {
    calls: Mutex<Vec<Uuid>>,
    fail_all: AtomicBool,
    failures_left: AtomicU32,
    delay_ms: AtomicU32,
}

impl RecordingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let provider = Self::default();
        provider.fail_all.store(true, Ordering::SeqCst);
        Arc::new(provider)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        let provider = Self::default();
        provider
            .delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
        Arc::new(provider)
    }

    pub fn fail_next(&self, times: u32) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl DeliveryProvider for RecordingProvider {
    async fn send(&self, id: Uuid, _recipient: &str, _content: &str) -> Result<(), Error> {
        self.calls.lock().push(id);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_millis(u64::from(delay))).await;
        }

        if self.fail_all.load(Ordering::SeqCst) {
            return Err(anyhow!("provider unavailable"));
        }

        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("transient provider failure"));
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

pub fn request(channel: Channel, priority: Priority) -> NewNotification {
    NewNotification {
        recipient: "+1555".to_string(),
        channel,
        content: "hi".to_string(),
        priority,
        scheduled_at: None,
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2,
    }
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        batch_size: 100,
        fetch_timeout: Duration::from_millis(10),
        idle_sleep: Duration::from_millis(5),
        rate_limit: 1000,
        concurrency: 16,
        shutdown_timeout: Duration::from_secs(2),
        retry: fast_retry(),
    }
}

pub fn readers(broker: &InMemoryBroker, channel: Channel) -> PriorityReaders {
    PriorityReaders {
        high: Arc::new(broker.reader(topic_name(channel, Priority::High))),
        medium: Arc::new(broker.reader(topic_name(channel, Priority::Medium))),
        low: Arc::new(broker.reader(topic_name(channel, Priority::Low))),
    }
}

/// The whole pipeline for one channel over the in-memory store and broker.
pub struct Pipeline {
    pub repository: InMemoryRepository,
    pub broker: InMemoryBroker,
    pub provider: Arc<RecordingProvider>,
    pub service: NotificationService,
    pub publisher: OutboxPublisher,
    pub worker: DeliveryWorker,
}

impl Pipeline {
    pub fn new(channel: Channel, provider: Arc<RecordingProvider>) -> Self {
        Self::with_config(channel, provider, worker_config())
    }

    pub fn with_config(
        channel: Channel,
        provider: Arc<RecordingProvider>,
        config: WorkerConfig,
    ) -> Self {
        let repository = InMemoryRepository::new();
        let broker = InMemoryBroker::new();

        let service = NotificationService::new(Arc::new(repository.clone()));
        let publisher = OutboxPublisher::new(
            Arc::new(repository.clone()),
            Arc::new(broker.clone()),
            PublisherConfig::default(),
        );
        let worker = DeliveryWorker::new(
            channel,
            readers(&broker, channel),
            Arc::new(repository.clone()),
            provider.clone(),
            Arc::new(broker.clone()),
            config,
        )
        .expect("worker config is valid");

        Self {
            repository,
            broker,
            provider,
            service,
            publisher,
            worker,
        }
    }

    /// A second publisher over the same store and broker that treats
    /// anything older than `stale_after` as stale.
    pub fn sweeping_publisher(&self, stale_after: Duration) -> OutboxPublisher {
        OutboxPublisher::new(
            Arc::new(self.repository.clone()),
            Arc::new(self.broker.clone()),
            PublisherConfig {
                stale_after: Some(stale_after),
                ..PublisherConfig::default()
            },
        )
    }
}
