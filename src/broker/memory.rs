use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    broker::{MessageWriter, TopicReader},
    models::message::{BrokerMessage, Delivery},
};

#[derive(Default)]
struct Topic {
    ready: VecDeque<Delivery>,
    unacked: HashMap<u64, Delivery>,
    written: Vec<Vec<u8>>,
    committed: usize,
    next_tag: u64,
}

/// Queue-per-topic broker kept in memory, with the same ack/requeue
/// semantics as the RabbitMQ client.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
    fail_writes: Arc<AtomicBool>,
}

pub struct InMemoryReader {
    broker: InMemoryBroker,
    topic: String,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn reader(&self, topic: impl Into<String>) -> InMemoryReader {
        InMemoryReader {
            broker: self.clone(),
            topic: topic.into(),
            closed: AtomicBool::new(false),
        }
    }

    /// Every payload ever written to `topic`, in write order.
    pub fn written(&self, topic: &str) -> Vec<Vec<u8>> {
        self.topics
            .lock()
            .get(topic)
            .map(|t| t.written.clone())
            .unwrap_or_default()
    }

    pub fn ready_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, |t| t.ready.len())
    }

    pub fn unacked_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, |t| t.unacked.len())
    }

    pub fn committed_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, |t| t.committed)
    }
}

#[async_trait]
impl MessageWriter for InMemoryBroker {
    async fn write_messages(&self, messages: Vec<BrokerMessage>) -> Result<(), Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("broker unavailable"));
        }

        let mut topics = self.topics.lock();
        for message in messages {
            let topic = topics.entry(message.topic.clone()).or_default();
            topic.next_tag += 1;
            topic.written.push(message.value.clone());
            topic.ready.push_back(Delivery {
                topic: message.topic,
                payload: message.value,
                delivery_tag: topic.next_tag,
                redelivered: false,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl TopicReader for InMemoryReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn fetch_message(&self) -> Result<Option<Delivery>, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("reader for {} is closed", self.topic));
        }

        let mut topics = self.broker.topics.lock();
        let topic = topics.entry(self.topic.clone()).or_default();

        let delivery = topic.ready.pop_front();
        if let Some(d) = &delivery {
            topic.unacked.insert(d.delivery_tag, d.clone());
        }

        Ok(delivery)
    }

    async fn commit(&self, delivery: &Delivery) -> Result<(), Error> {
        let mut topics = self.broker.topics.lock();
        let topic = topics.entry(self.topic.clone()).or_default();

        topic
            .unacked
            .remove(&delivery.delivery_tag)
            .ok_or_else(|| anyhow!("unknown delivery tag {}", delivery.delivery_tag))?;
        topic.committed += 1;

        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), Error> {
        let mut topics = self.broker.topics.lock();
        let topic = topics.entry(self.topic.clone()).or_default();

        let mut released = topic
            .unacked
            .remove(&delivery.delivery_tag)
            .ok_or_else(|| anyhow!("unknown delivery tag {}", delivery.delivery_tag))?;
        released.redelivered = true;
        topic.ready.push_back(released);

        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);

        let mut topics = self.broker.topics.lock();
        let topic = topics.entry(self.topic.clone()).or_default();

        let mut outstanding: Vec<Delivery> = topic.unacked.drain().map(|(_, d)| d).collect();
        outstanding.sort_by_key(|d| d.delivery_tag);
        for mut delivery in outstanding.into_iter().rev() {
            delivery.redelivered = true;
            topic.ready.push_front(delivery);
        }

        Ok(())
    }
}
