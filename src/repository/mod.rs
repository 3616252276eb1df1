//! Persistent store contract for notifications and their outbox rows.
//!
//! Every implementation must be safe under concurrent callers: several
//! publisher and worker replicas share one store.

pub mod memory;

use anyhow::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    notification::{Channel, Notification},
    outbox::OutboxEvent,
    status::{NotificationStatus, OutboxStatus},
};

pub use memory::InMemoryRepository;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    pub status: Option<NotificationStatus>,
    pub channel: Option<Channel>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    pub total: i64,
}

impl Pagination {
    pub fn page(page: u32, limit: i64) -> Self {
        let page = i64::from(page.max(1));
        Self {
            limit,
            offset: (page - 1) * limit,
        }
    }
}

/// Pending outbox rows held by one publisher. The rows stay locked against
/// other claimants until [`OutboxClaim::mark_published`] runs; dropping the
/// claim releases them unchanged.
#[async_trait]
pub trait OutboxClaim: Send {
    fn events(&self) -> &[OutboxEvent];

    async fn mark_published(self: Box<Self>) -> Result<(), Error>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Inserts the notification and, when present, its outbox row in one
    /// transaction.
    async fn create_with_event(
        &self,
        notification: &Notification,
        event: Option<&OutboxEvent>,
    ) -> Result<(), Error>;

    /// Bulk variant of [`NotificationRepository::create_with_event`]; all rows
    /// or none.
    async fn bulk_insert_with_events(
        &self,
        notifications: &[Notification],
        events: &[OutboxEvent],
    ) -> Result<(), Error>;

    /// Oldest-first pending rows, skipping rows locked by another claimant.
    async fn claim_pending_events(&self, limit: i64) -> Result<Box<dyn OutboxClaim>, Error>;

    async fn mark_pending(&self, ids: &[Uuid]) -> Result<(), Error>;

    /// Records that the broker confirmed the write of these `published` rows.
    async fn confirm_published(&self, ids: &[Uuid]) -> Result<(), Error>;

    /// Moves rows marked `published` before `older_than` whose broker write
    /// was never confirmed back to `pending`. Confirmed rows are left alone
    /// however long they wait in the broker. Returns the number of rows reset.
    async fn reset_stale_published(&self, older_than: DateTime<Utc>) -> Result<u64, Error>;

    /// Settles rows claimed for delivery before `older_than` and never
    /// finished: `sended` when the notification already is, otherwise
    /// `pending` for republishing with the retry count unchanged. Returns
    /// the number of rows moved.
    async fn reset_stale_deliveries(&self, older_than: DateTime<Utc>) -> Result<u64, Error>;

    async fn find_event_by_aggregate_id(
        &self,
        aggregate_id: Uuid,
    ) -> Result<Option<OutboxEvent>, Error>;

    /// Conditionally moves a `published`, non-exhausted event to
    /// `delivering`. Only one concurrent caller gets `true`.
    async fn claim_event_for_delivery(&self, aggregate_id: Uuid) -> Result<bool, Error>;

    async fn update_event_status(
        &self,
        aggregate_id: Uuid,
        status: OutboxStatus,
        retry_count: i32,
    ) -> Result<(), Error>;

    async fn update_notification_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
    ) -> Result<(), Error>;

    async fn list_notifications(
        &self,
        filter: &ListFilter,
        pagination: Pagination,
    ) -> Result<NotificationPage, Error>;

    async fn find_notification_by_id(&self, id: Uuid) -> Result<Option<Notification>, Error>;

    async fn health_check(&self) -> Result<(), Error>;
}
