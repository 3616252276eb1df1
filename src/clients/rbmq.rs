use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    message::BasicGetMessage,
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    broker::{MessageWriter, TopicReader, all_topics},
    models::message::{BrokerMessage, Delivery},
};

/// RabbitMQ binding of the broker contract. Each topic is a durable queue;
/// readers sharing a queue form the consumer group.
pub struct RabbitMqClient {
    connection: Connection,
}

pub struct RabbitMqWriter {
    channel: Channel,
}

type PendingGet = JoinHandle<Result<Option<BasicGetMessage>, lapin::Error>>;

/// The `basic.get` runs on its own task and survives a cancelled fetch, so a
/// caller-side timeout never strands a message already handed to this
/// channel; the next fetch picks it up.
pub struct RabbitMqReader {
    channel: Channel,
    topic: String,
    group: String,
    pending: Mutex<Option<PendingGet>>,
}

impl RabbitMqClient {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        info!("RabbitMQ connection established");

        Ok(Self { connection })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn channel(&self) -> Result<Channel, Error> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))
    }

    /// Declares the durable queue of every topic, dead-letter queues
    /// included.
    pub async fn declare_topology(&self) -> Result<(), Error> {
        let channel = self.channel().await?;

        for topic in all_topics() {
            channel
                .queue_declare(
                    &topic,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| anyhow!("Failed to declare queue {}: {}", topic, e))?;

            debug!(topic = %topic, "Queue declared");
        }

        info!("Broker topology declared");

        Ok(())
    }

    /// A writer on its own channel in publisher-confirm mode.
    pub async fn writer(&self) -> Result<RabbitMqWriter, Error> {
        let channel = self.channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        Ok(RabbitMqWriter { channel })
    }

    pub async fn reader(&self, topic: &str, group: &str) -> Result<RabbitMqReader, Error> {
        let channel = self.channel().await?;

        info!(topic, group, "Topic reader created");

        Ok(RabbitMqReader {
            channel,
            topic: topic.to_string(),
            group: group.to_string(),
            pending: Mutex::new(None),
        })
    }
}

#[async_trait]
impl MessageWriter for RabbitMqWriter {
    async fn write_messages(&self, messages: Vec<BrokerMessage>) -> Result<(), Error> {
        let mut confirms = Vec::with_capacity(messages.len());

        for message in &messages {
            let mut properties = BasicProperties::default().with_delivery_mode(2);
            if let Some(key) = &message.key {
                properties =
                    properties.with_message_id(String::from_utf8_lossy(key).into_owned().into());
            }

            let confirm = self
                .channel
                .basic_publish(
                    "",
                    &message.topic,
                    BasicPublishOptions::default(),
                    &message.value,
                    properties,
                )
                .await
                .map_err(|e| anyhow!("Failed to publish to {}: {}", message.topic, e))?;

            confirms.push(confirm);
        }

        for (confirm, message) in confirms.into_iter().zip(&messages) {
            let confirmation = confirm
                .await
                .map_err(|e| anyhow!("Publish to {} was not confirmed: {}", message.topic, e))?;

            if confirmation.is_nack() {
                return Err(anyhow!("Broker rejected message for {}", message.topic));
            }
        }

        debug!(count = messages.len(), "Batch confirmed by broker");

        Ok(())
    }
}

#[async_trait]
impl TopicReader for RabbitMqReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn fetch_message(&self) -> Result<Option<Delivery>, Error> {
        let mut pending = self.pending.lock().await;
        let get = pending.get_or_insert_with(|| {
            let channel = self.channel.clone();
            let topic = self.topic.clone();
            tokio::spawn(async move { channel.basic_get(&topic, BasicGetOptions::default()).await })
        });

        let joined = get.await;
        *pending = None;

        let message = joined
            .map_err(|e| anyhow!("Fetch task for {} failed: {}", self.topic, e))?
            .map_err(|e| anyhow!("Failed to fetch from {}: {}", self.topic, e))?;

        Ok(message.map(|m| Delivery {
            topic: self.topic.clone(),
            payload: m.delivery.data.clone(),
            delivery_tag: m.delivery.delivery_tag,
            redelivered: m.delivery.redelivered,
        }))
    }

    async fn commit(&self, delivery: &Delivery) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))?;

        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), Error> {
        self.channel
            .basic_nack(
                delivery.delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|e| anyhow!("Failed to requeue message: {}", e))?;

        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if let Err(e) = self.channel.close(200, "reader closed").await {
            warn!(topic = %self.topic, group = %self.group, error = %e, "Failed to close reader channel");
            return Err(anyhow!("Failed to close reader for {}: {}", self.topic, e));
        }

        info!(topic = %self.topic, group = %self.group, "Topic reader closed");

        Ok(())
    }
}
