use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    PgPool, Postgres, QueryBuilder, Row, Transaction,
    postgres::{PgPoolOptions, PgRow},
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    models::{
        notification::Notification,
        outbox::{MAX_RETRY_COUNT, OutboxEvent},
        status::{NotificationStatus, OutboxStatus},
    },
    repository::{ListFilter, NotificationPage, NotificationRepository, OutboxClaim, Pagination},
};

const NOTIFICATION_COLUMNS: &str =
    "id, group_id, recipient, channel, content, status, priority, scheduled_at, created_at";

const OUTBOX_COLUMNS: &str = "id, aggregate_id, group_id, event_type, topic, payload, status, \
     retry_count, created_at, published_at, confirmed_at, claimed_at";

#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

struct PostgresClaim {
    tx: Transaction<'static, Postgres>,
    events: Vec<OutboxEvent>,
}

impl PostgresRepository {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        info!("PostgreSQL connection established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_notifications(
    tx: &mut Transaction<'_, Postgres>,
    notifications: &[Notification],
) -> Result<(), Error> {
    let mut ids = Vec::with_capacity(notifications.len());
    let mut group_ids = Vec::with_capacity(notifications.len());
    let mut recipients = Vec::with_capacity(notifications.len());
    let mut channels = Vec::with_capacity(notifications.len());
    let mut contents = Vec::with_capacity(notifications.len());
    let mut statuses = Vec::with_capacity(notifications.len());
    let mut priorities = Vec::with_capacity(notifications.len());
    let mut scheduled = Vec::with_capacity(notifications.len());
    let mut created = Vec::with_capacity(notifications.len());

    for n in notifications {
        ids.push(n.id);
        group_ids.push(n.group_id);
        recipients.push(n.recipient.clone());
        channels.push(n.channel.as_str().to_string());
        contents.push(n.content.clone());
        statuses.push(n.status.as_str().to_string());
        priorities.push(n.priority.as_str().to_string());
        scheduled.push(n.scheduled_at);
        created.push(n.created_at);
    }

    sqlx::query(
        r#"
        INSERT INTO notifications (
            id, group_id, recipient, channel, content,
            status, priority, scheduled_at, created_at
        )
        SELECT * FROM UNNEST(
            $1::uuid[], $2::uuid[], $3::text[], $4::text[], $5::text[],
            $6::text[], $7::text[], $8::timestamptz[], $9::timestamptz[]
        )
        "#,
    )
    .bind(ids)
    .bind(group_ids)
    .bind(recipients)
    .bind(channels)
    .bind(contents)
    .bind(statuses)
    .bind(priorities)
    .bind(scheduled)
    .bind(created)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn insert_outbox(
    tx: &mut Transaction<'_, Postgres>,
    events: &[OutboxEvent],
) -> Result<(), Error> {
    let mut ids = Vec::with_capacity(events.len());
    let mut aggregate_ids = Vec::with_capacity(events.len());
    let mut group_ids = Vec::with_capacity(events.len());
    let mut event_types = Vec::with_capacity(events.len());
    let mut topics = Vec::with_capacity(events.len());
    let mut payloads = Vec::with_capacity(events.len());
    let mut retry_counts = Vec::with_capacity(events.len());
    let mut created = Vec::with_capacity(events.len());

    for e in events {
        ids.push(e.id);
        aggregate_ids.push(e.aggregate_id);
        group_ids.push(e.group_id);
        event_types.push(e.event_type.clone());
        topics.push(e.topic.clone());
        payloads.push(e.payload.clone());
        retry_counts.push(e.retry_count);
        created.push(e.created_at);
    }

    sqlx::query(
        r#"
        INSERT INTO outbox (
            id, aggregate_id, group_id, event_type, topic,
            payload, retry_count, created_at, status
        )
        SELECT *, 'pending' FROM UNNEST(
            $1::uuid[], $2::uuid[], $3::uuid[], $4::text[], $5::text[],
            $6::bytea[], $7::int4[], $8::timestamptz[]
        )
        "#,
    )
    .bind(ids)
    .bind(aggregate_ids)
    .bind(group_ids)
    .bind(event_types)
    .bind(topics)
    .bind(payloads)
    .bind(retry_counts)
    .bind(created)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn notification_from_row(row: &PgRow) -> Result<Notification, Error> {
    Ok(Notification {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        recipient: row.try_get("recipient")?,
        channel: row.try_get::<String, _>("channel")?.parse()?,
        content: row.try_get("content")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        priority: row.try_get::<String, _>("priority")?.parse()?,
        scheduled_at: row.try_get("scheduled_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<OutboxEvent, Error> {
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        group_id: row.try_get("group_id")?,
        event_type: row.try_get("event_type")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
        confirmed_at: row.try_get("confirmed_at")?,
        claimed_at: row.try_get("claimed_at")?,
    })
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &ListFilter) {
    builder.push(" WHERE 1=1");

    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(channel) = filter.channel {
        builder.push(" AND channel = ").push_bind(channel.as_str());
    }
    if let Some(start) = filter.start_date {
        builder.push(" AND created_at >= ").push_bind(start);
    }
    if let Some(end) = filter.end_date {
        builder.push(" AND created_at <= ").push_bind(end);
    }
}

#[async_trait]
impl OutboxClaim for PostgresClaim {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn mark_published(self: Box<Self>) -> Result<(), Error> {
        let PostgresClaim { mut tx, events } = *self;
        let ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();

        sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'published',
                published_at = now(),
                confirmed_at = NULL
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!("Failed to mark outbox rows published: {}", e))?;

        tx.commit().await?;

        debug!(count = ids.len(), "Outbox rows marked published");

        Ok(())
    }
}

#[async_trait]
impl NotificationRepository for PostgresRepository {
    async fn create_with_event(
        &self,
        notification: &Notification,
        event: Option<&OutboxEvent>,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, group_id, recipient, channel, content,
                status, priority, scheduled_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(notification.id)
        .bind(notification.group_id)
        .bind(&notification.recipient)
        .bind(notification.channel.as_str())
        .bind(&notification.content)
        .bind(notification.status.as_str())
        .bind(notification.priority.as_str())
        .bind(notification.scheduled_at)
        .bind(notification.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!(error = %e, id = %notification.id, "Failed to insert notification");
            anyhow!("Database write failed: {}", e)
        })?;

        if let Some(event) = event {
            sqlx::query(
                r#"
                INSERT INTO outbox (
                    id, aggregate_id, group_id, event_type, topic,
                    payload, status, retry_count, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7)
                "#,
            )
            .bind(event.id)
            .bind(event.aggregate_id)
            .bind(event.group_id)
            .bind(&event.event_type)
            .bind(&event.topic)
            .bind(&event.payload)
            .bind(event.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!(error = %e, id = %notification.id, "Failed to insert outbox row");
                anyhow!("Database write failed: {}", e)
            })?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn bulk_insert_with_events(
        &self,
        notifications: &[Notification],
        events: &[OutboxEvent],
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        insert_notifications(&mut tx, notifications)
            .await
            .map_err(|e| anyhow!("Bulk notification insert failed: {}", e))?;

        if !events.is_empty() {
            insert_outbox(&mut tx, events)
                .await
                .map_err(|e| anyhow!("Bulk outbox insert failed: {}", e))?;
        }

        tx.commit().await?;

        debug!(
            notifications = notifications.len(),
            events = events.len(),
            "Bulk insert committed"
        );

        Ok(())
    }

    async fn claim_pending_events(&self, limit: i64) -> Result<Box<dyn OutboxClaim>, Error> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE status = 'pending'
            ORDER BY created_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| anyhow!("Failed to claim pending outbox rows: {}", e))?;

        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Box::new(PostgresClaim { tx, events }))
    }

    async fn mark_pending(&self, ids: &[Uuid]) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'pending',
                published_at = NULL,
                confirmed_at = NULL
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to mark outbox rows pending: {}", e))?;

        Ok(())
    }

    async fn confirm_published(&self, ids: &[Uuid]) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET confirmed_at = now()
            WHERE id = ANY($1)
              AND status = 'published'
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to confirm outbox rows: {}", e))?;

        Ok(())
    }

    async fn reset_stale_published(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'pending',
                published_at = NULL
            WHERE status = 'published'
              AND confirmed_at IS NULL
              AND published_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to reset stale outbox rows: {}", e))?;

        Ok(result.rows_affected())
    }

    async fn reset_stale_deliveries(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            UPDATE outbox o
            SET status = CASE WHEN n.status = 'sended' THEN 'sended' ELSE 'pending' END,
                published_at = CASE WHEN n.status = 'sended' THEN o.published_at END,
                confirmed_at = CASE WHEN n.status = 'sended' THEN o.confirmed_at END,
                claimed_at = NULL
            FROM notifications n
            WHERE n.id = o.aggregate_id
              AND o.status = 'delivering'
              AND o.claimed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to reset stale deliveries: {}", e))?;

        Ok(result.rows_affected())
    }

    async fn find_event_by_aggregate_id(
        &self,
        aggregate_id: Uuid,
    ) -> Result<Option<OutboxEvent>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE aggregate_id = $1"
        ))
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to fetch outbox row: {}", e))?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn claim_event_for_delivery(&self, aggregate_id: Uuid) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'delivering',
                claimed_at = now()
            WHERE aggregate_id = $1
              AND status = 'published'
              AND retry_count <= $2
            "#,
        )
        .bind(aggregate_id)
        .bind(MAX_RETRY_COUNT)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to claim outbox row for delivery: {}", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_event_status(
        &self,
        aggregate_id: Uuid,
        status: OutboxStatus,
        retry_count: i32,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET status = $1,
                retry_count = $2
            WHERE aggregate_id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(retry_count)
        .bind(aggregate_id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to update outbox row: {}", e))?;

        Ok(())
    }

    async fn update_notification_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE notifications SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!("Failed to update notification status: {}", e))?;

        Ok(())
    }

    async fn list_notifications(
        &self,
        filter: &ListFilter,
        pagination: Pagination,
    ) -> Result<NotificationPage, Error> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM notifications");
        push_filters(&mut count, filter);

        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow!("Failed to count notifications: {}", e))?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications"
        ));
        push_filters(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(pagination.limit)
            .push(" OFFSET ")
            .push_bind(pagination.offset);

        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!("Failed to list notifications: {}", e))?;

        let notifications = rows
            .iter()
            .map(notification_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NotificationPage {
            notifications,
            total,
        })
    }

    async fn find_notification_by_id(&self, id: Uuid) -> Result<Option<Notification>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to fetch notification: {}", e))?;

        row.as_ref().map(notification_from_row).transpose()
    }

    async fn health_check(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }
}
