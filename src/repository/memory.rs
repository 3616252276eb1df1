use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Error, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    models::{
        notification::Notification,
        outbox::{MAX_RETRY_COUNT, OutboxEvent},
        status::{NotificationStatus, OutboxStatus},
    },
    repository::{ListFilter, NotificationPage, NotificationRepository, OutboxClaim, Pagination},
};

#[derive(Default)]
struct State {
    notifications: HashMap<Uuid, Notification>,
    outbox: Vec<OutboxEvent>,
    locked: HashSet<Uuid>,
}

/// Process-local store with the same transactional guarantees as the
/// Postgres repository. Used by tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<State>>,
    fail_outbox_writes: Arc<AtomicBool>,
}

struct InMemoryClaim {
    state: Arc<Mutex<State>>,
    events: Vec<OutboxEvent>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent outbox insert fail, after the notification
    /// rows were staged.
    pub fn fail_outbox_writes(&self, fail: bool) {
        self.fail_outbox_writes.store(fail, Ordering::SeqCst);
    }

    pub fn notifications(&self) -> Vec<Notification> {
        let state = self.state.lock();
        let mut all: Vec<Notification> = state.notifications.values().cloned().collect();
        all.sort_by_key(|n| n.created_at);
        all
    }

    pub fn notification(&self, id: Uuid) -> Option<Notification> {
        self.state.lock().notifications.get(&id).cloned()
    }

    pub fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.state.lock().outbox.clone()
    }

    pub fn event_for(&self, aggregate_id: Uuid) -> Option<OutboxEvent> {
        self.state
            .lock()
            .outbox
            .iter()
            .find(|e| e.aggregate_id == aggregate_id)
            .cloned()
    }

    /// Overwrites an outbox row. Lets tests stage arbitrary lifecycle states.
    pub fn put_event(&self, event: OutboxEvent) {
        let mut state = self.state.lock();
        match state.outbox.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event,
            None => state.outbox.push(event),
        }
    }

    fn stage(
        &self,
        state: &State,
        notifications: &[Notification],
        events: &[OutboxEvent],
    ) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for n in notifications {
            if state.notifications.contains_key(&n.id) || !seen.insert(n.id) {
                bail!("duplicate key value violates unique constraint \"notifications_pkey\"");
            }
        }

        if events.is_empty() {
            return Ok(());
        }

        if self.fail_outbox_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("outbox insert failed"));
        }

        for e in events {
            let known = seen.contains(&e.aggregate_id)
                || state.notifications.contains_key(&e.aggregate_id);
            if !known {
                bail!("outbox row {} references unknown notification", e.id);
            }
            if state.outbox.iter().any(|o| o.aggregate_id == e.aggregate_id) {
                bail!("duplicate outbox row for notification {}", e.aggregate_id);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl OutboxClaim for InMemoryClaim {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn mark_published(self: Box<Self>) -> Result<(), Error> {
        let now = Utc::now();
        let mut state = self.state.lock();

        for claimed in &self.events {
            if let Some(row) = state.outbox.iter_mut().find(|e| e.id == claimed.id) {
                row.status = OutboxStatus::Published;
                row.published_at = Some(now);
                row.confirmed_at = None;
            }
        }

        Ok(())
    }
}

impl Drop for InMemoryClaim {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        for event in &self.events {
            state.locked.remove(&event.id);
        }
    }
}

#[async_trait]
impl NotificationRepository for InMemoryRepository {
    async fn create_with_event(
        &self,
        notification: &Notification,
        event: Option<&OutboxEvent>,
    ) -> Result<(), Error> {
        let events: Vec<OutboxEvent> = event.into_iter().cloned().collect();
        self.bulk_insert_with_events(std::slice::from_ref(notification), &events)
            .await
    }

    async fn bulk_insert_with_events(
        &self,
        notifications: &[Notification],
        events: &[OutboxEvent],
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        self.stage(&state, notifications, events)?;

        for n in notifications {
            state.notifications.insert(n.id, n.clone());
        }
        for e in events {
            let mut row = e.clone();
            row.status = OutboxStatus::Pending;
            state.outbox.push(row);
        }

        Ok(())
    }

    async fn claim_pending_events(&self, limit: i64) -> Result<Box<dyn OutboxClaim>, Error> {
        let mut state = self.state.lock();
        let limit = usize::try_from(limit.max(0))?;

        let mut pending: Vec<OutboxEvent> = state
            .outbox
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending && !state.locked.contains(&e.id))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit);

        for e in &pending {
            state.locked.insert(e.id);
        }

        Ok(Box::new(InMemoryClaim {
            state: Arc::clone(&self.state),
            events: pending,
        }))
    }

    async fn mark_pending(&self, ids: &[Uuid]) -> Result<(), Error> {
        let mut state = self.state.lock();
        for row in state.outbox.iter_mut().filter(|e| ids.contains(&e.id)) {
            row.status = OutboxStatus::Pending;
            row.published_at = None;
            row.confirmed_at = None;
        }
        Ok(())
    }

    async fn confirm_published(&self, ids: &[Uuid]) -> Result<(), Error> {
        let now = Utc::now();
        let mut state = self.state.lock();
        for row in state
            .outbox
            .iter_mut()
            .filter(|e| e.status == OutboxStatus::Published && ids.contains(&e.id))
        {
            row.confirmed_at = Some(now);
        }
        Ok(())
    }

    async fn reset_stale_published(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        let mut state = self.state.lock();
        let mut reset = 0;

        for row in state.outbox.iter_mut() {
            let stale = row.status == OutboxStatus::Published
                && row.confirmed_at.is_none()
                && row.published_at.is_some_and(|at| at < older_than);
            if stale {
                row.status = OutboxStatus::Pending;
                row.published_at = None;
                reset += 1;
            }
        }

        Ok(reset)
    }

    async fn reset_stale_deliveries(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        let mut state = self.state.lock();
        let State {
            notifications,
            outbox,
            ..
        } = &mut *state;
        let mut reset = 0;

        for row in outbox.iter_mut() {
            let stale = row.status == OutboxStatus::Delivering
                && row.claimed_at.is_some_and(|at| at < older_than);
            if !stale {
                continue;
            }

            let delivered = notifications
                .get(&row.aggregate_id)
                .is_some_and(|n| n.status == NotificationStatus::Sended);
            if delivered {
                row.status = OutboxStatus::Sended;
            } else {
                row.status = OutboxStatus::Pending;
                row.published_at = None;
                row.confirmed_at = None;
            }
            row.claimed_at = None;
            reset += 1;
        }

        Ok(reset)
    }

    async fn find_event_by_aggregate_id(
        &self,
        aggregate_id: Uuid,
    ) -> Result<Option<OutboxEvent>, Error> {
        Ok(self.event_for(aggregate_id))
    }

    async fn claim_event_for_delivery(&self, aggregate_id: Uuid) -> Result<bool, Error> {
        let mut state = self.state.lock();

        match state.outbox.iter_mut().find(|e| {
            e.aggregate_id == aggregate_id
                && e.status == OutboxStatus::Published
                && e.retry_count <= MAX_RETRY_COUNT
        }) {
            Some(row) => {
                row.status = OutboxStatus::Delivering;
                row.claimed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_event_status(
        &self,
        aggregate_id: Uuid,
        status: OutboxStatus,
        retry_count: i32,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        for row in state
            .outbox
            .iter_mut()
            .filter(|e| e.aggregate_id == aggregate_id)
        {
            row.status = status;
            row.retry_count = retry_count;
        }
        Ok(())
    }

    async fn update_notification_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
    ) -> Result<(), Error> {
        if let Some(n) = self.state.lock().notifications.get_mut(&id) {
            n.status = status;
        }
        Ok(())
    }

    async fn list_notifications(
        &self,
        filter: &ListFilter,
        pagination: Pagination,
    ) -> Result<NotificationPage, Error> {
        let state = self.state.lock();

        let mut matching: Vec<&Notification> = state
            .notifications
            .values()
            .filter(|n| filter.status.is_none_or(|s| n.status == s))
            .filter(|n| filter.channel.is_none_or(|c| n.channel == c))
            .filter(|n| filter.start_date.is_none_or(|d| n.created_at >= d))
            .filter(|n| filter.end_date.is_none_or(|d| n.created_at <= d))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = i64::try_from(matching.len())?;
        let notifications = matching
            .into_iter()
            .skip(usize::try_from(pagination.offset.max(0))?)
            .take(usize::try_from(pagination.limit.max(0))?)
            .cloned()
            .collect();

        Ok(NotificationPage {
            notifications,
            total,
        })
    }

    async fn find_notification_by_id(&self, id: Uuid) -> Result<Option<Notification>, Error> {
        Ok(self.notification(id))
    }

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}
