use std::sync::Arc;

use anyhow::{Error, Result};
use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    models::{
        notification::{NewNotification, Notification},
        outbox::OutboxEvent,
    },
    repository::{ListFilter, NotificationPage, NotificationRepository, Pagination},
};

pub const PAGE_LIMIT: i64 = 20;

/// Creation side of the pipeline: every notification is written together
/// with its outbox row, so nothing reaches the broker that is not stored.
#[derive(Clone)]
pub struct NotificationService {
    repository: Arc<dyn NotificationRepository>,
}

impl NotificationService {
    pub fn new(repository: Arc<dyn NotificationRepository>) -> Self {
        Self { repository }
    }

    pub async fn create(&self, request: NewNotification) -> Result<Notification, Error> {
        let now = Utc::now();
        let notification = Notification::new(request, None, now);
        let event = OutboxEvent::for_notification(&notification, now)?;

        self.repository
            .create_with_event(&notification, event.as_ref())
            .await
            .inspect_err(|e| error!(error = %e, id = %notification.id, "Failed to create notification"))?;

        info!(
            id = %notification.id,
            channel = %notification.channel,
            priority = %notification.priority,
            scheduled = event.is_none(),
            "Notification created"
        );

        Ok(notification)
    }

    /// Creates every notification under one shared group id. All rows are
    /// written in a single transaction. Returns the group id.
    pub async fn bulk_create(&self, requests: Vec<NewNotification>) -> Result<Uuid, Error> {
        let now = Utc::now();
        let group_id = Uuid::new_v4();

        let notifications: Vec<Notification> = requests
            .into_iter()
            .map(|request| Notification::new(request, Some(group_id), now))
            .collect();

        let mut events = Vec::with_capacity(notifications.len());
        for notification in &notifications {
            if let Some(event) = OutboxEvent::for_notification(notification, now)? {
                events.push(event);
            }
        }

        self.repository
            .bulk_insert_with_events(&notifications, &events)
            .await
            .inspect_err(|e| error!(error = %e, group_id = %group_id, "Failed to create notification batch"))?;

        info!(
            group_id = %group_id,
            notifications = notifications.len(),
            events = events.len(),
            "Notification batch created"
        );

        Ok(group_id)
    }

    pub async fn list(&self, filter: &ListFilter, page: u32) -> Result<NotificationPage, Error> {
        self.repository
            .list_notifications(filter, Pagination::page(page, PAGE_LIMIT))
            .await
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<Notification>, Error> {
        self.repository.find_notification_by_id(id).await
    }
}
