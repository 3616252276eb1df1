use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    broker::topic_name,
    models::{notification::Notification, status::OutboxStatus},
};

pub const NOTIFICATION_CREATED: &str = "NotificationCreated";

/// Highest retry count that still allows a delivery attempt. An event that
/// fails at this count is abandoned, giving seven attempts in total.
pub const MAX_RETRY_COUNT: i32 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub group_id: Uuid,
    pub event_type: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    /// Set when the row is marked `published`, before the broker write.
    pub published_at: Option<DateTime<Utc>>,
    /// Set once the broker has confirmed the write.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Set when a worker claims the row for delivery.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Builds the `NotificationCreated` event for a freshly created
    /// notification. Returns `None` for notifications scheduled in the future.
    pub fn for_notification(
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, Error> {
        if notification.is_scheduled_after(now) {
            return Ok(None);
        }

        let payload = serde_json::to_vec(notification)?;

        Ok(Some(Self {
            id: Uuid::new_v4(),
            aggregate_id: notification.id,
            group_id: notification.group_id,
            event_type: NOTIFICATION_CREATED.to_string(),
            topic: topic_name(notification.channel, notification.priority),
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            created_at: now,
            published_at: None,
            confirmed_at: None,
            claimed_at: None,
        }))
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count > MAX_RETRY_COUNT
    }

    /// Status and retry count to persist after a failed delivery attempt.
    pub fn after_failure(&self) -> (OutboxStatus, i32) {
        let status = if self.retry_count < MAX_RETRY_COUNT {
            OutboxStatus::Pending
        } else {
            OutboxStatus::Failed
        };

        (status, self.retry_count + 1)
    }
}
