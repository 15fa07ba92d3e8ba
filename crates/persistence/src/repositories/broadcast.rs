//! Broadcast repository for database operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::models::{Broadcast, BroadcastProgress, BroadcastStatus, RecipientOutcome};
use domain::store::{BroadcastStore, StoreError};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::entities::{BroadcastEntity, BroadcastRecipientEntity};
use crate::metrics::QueryTimer;

const BROADCAST_COLUMNS: &str = r#"
    id, user_id, device_id, recipient_spec, payload, status, scheduled_at,
    sent_count, failed_count, total_count, created_at, started_at, completed_at
"#;

/// Repository for broadcasts and their per-recipient outcome log.
#[derive(Clone)]
pub struct BroadcastRepository {
    pool: PgPool,
}

impl BroadcastRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert_broadcast(&self, broadcast: &Broadcast) -> Result<(), sqlx::Error> {
        let timer = QueryTimer::new("insert_broadcast");
        let result = sqlx::query(
            r#"
            INSERT INTO broadcasts (
                id, user_id, device_id, recipient_spec, payload, status, scheduled_at,
                sent_count, failed_count, total_count, created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(broadcast.id)
        .bind(broadcast.user_id)
        .bind(broadcast.device_id)
        .bind(Json(&broadcast.recipient_spec))
        .bind(Json(&broadcast.payload))
        .bind(broadcast.status.as_str())
        .bind(broadcast.scheduled_at)
        .bind(broadcast.progress.sent_count)
        .bind(broadcast.progress.failed_count)
        .bind(broadcast.progress.total_count)
        .bind(broadcast.created_at)
        .bind(broadcast.started_at)
        .bind(broadcast.completed_at)
        .execute(&self.pool)
        .await;
        timer.observe(&result);
        result.map(|_| ())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<BroadcastEntity>, sqlx::Error> {
        let query = format!("SELECT {} FROM broadcasts WHERE id = $1", BROADCAST_COLUMNS);
        sqlx::query_as::<_, BroadcastEntity>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Newest first.
    pub async fn find_by_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BroadcastEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_broadcasts_by_user");
        let query = format!(
            "SELECT {} FROM broadcasts WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            BROADCAST_COLUMNS
        );
        let result = sqlx::query_as::<_, BroadcastEntity>(&query)
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await;
        timer.observe(&result);
        result
    }

    /// Compare-and-set on the status column.
    pub async fn compare_and_set_status(
        &self,
        id: Uuid,
        from: &[BroadcastStatus],
        to: BroadcastStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let started_at = (to == BroadcastStatus::Running).then_some(at);
        let completed_at = to.is_terminal().then_some(at);

        let timer = QueryTimer::new("transition_broadcast");
        let result = sqlx::query(
            r#"
            UPDATE broadcasts
            SET status = $3,
                started_at = COALESCE($4, started_at),
                completed_at = COALESCE($5, completed_at)
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to.as_str())
        .bind(started_at)
        .bind(completed_at)
        .execute(&self.pool)
        .await;
        timer.observe(&result);
        Ok(result?.rows_affected() == 1)
    }

    pub async fn set_progress(
        &self,
        id: Uuid,
        progress: &BroadcastProgress,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE broadcasts
            SET sent_count = $2, failed_count = $3, total_count = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(progress.sent_count)
        .bind(progress.failed_count)
        .bind(progress.total_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Appends an outcome. A second outcome for the same position is ignored.
    pub async fn insert_outcome(&self, outcome: &RecipientOutcome) -> Result<(), sqlx::Error> {
        let timer = QueryTimer::new("insert_broadcast_outcome");
        let result = sqlx::query(
            r#"
            INSERT INTO broadcast_recipients (
                broadcast_id, position, recipient, status, reason, provider_message_id, processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (broadcast_id, position) DO NOTHING
            "#,
        )
        .bind(outcome.broadcast_id)
        .bind(outcome.position)
        .bind(&outcome.recipient)
        .bind(outcome.status.as_str())
        .bind(outcome.reason.as_deref())
        .bind(outcome.provider_message_id.as_deref())
        .bind(outcome.at)
        .execute(&self.pool)
        .await;
        timer.observe(&result);
        result.map(|_| ())
    }

    pub async fn find_outcomes(
        &self,
        broadcast_id: Uuid,
    ) -> Result<Vec<BroadcastRecipientEntity>, sqlx::Error> {
        sqlx::query_as::<_, BroadcastRecipientEntity>(
            r#"
            SELECT broadcast_id, position, recipient, status, reason, provider_message_id, processed_at
            FROM broadcast_recipients
            WHERE broadcast_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(broadcast_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Scheduled broadcasts due at or before `until`, oldest schedule first.
    pub async fn find_due(
        &self,
        until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BroadcastEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_due_broadcasts");
        let query = format!(
            "SELECT {} FROM broadcasts WHERE status = 'scheduled' AND scheduled_at <= $1 \
             ORDER BY scheduled_at ASC LIMIT $2",
            BROADCAST_COLUMNS
        );
        let result = sqlx::query_as::<_, BroadcastEntity>(&query)
            .bind(until)
            .bind(limit)
            .fetch_all(&self.pool)
            .await;
        timer.observe(&result);
        result
    }

    /// Scheduled broadcasts targeting the device, oldest schedule first.
    pub async fn find_scheduled_by_device(
        &self,
        device_id: Uuid,
    ) -> Result<Vec<BroadcastEntity>, sqlx::Error> {
        let query = format!(
            "SELECT {} FROM broadcasts WHERE device_id = $1 AND status = 'scheduled' \
             ORDER BY scheduled_at ASC",
            BROADCAST_COLUMNS
        );
        sqlx::query_as::<_, BroadcastEntity>(&query)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await
    }
}

fn into_broadcasts(entities: Vec<BroadcastEntity>) -> Result<Vec<Broadcast>, StoreError> {
    entities.into_iter().map(Broadcast::try_from).collect()
}

#[async_trait]
impl BroadcastStore for BroadcastRepository {
    async fn insert(&self, broadcast: &Broadcast) -> Result<(), StoreError> {
        Ok(self.insert_broadcast(broadcast).await?)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Broadcast>, StoreError> {
        self.find_by_id(id).await?.map(Broadcast::try_from).transpose()
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Broadcast>, StoreError> {
        into_broadcasts(self.find_by_user(user_id, limit, offset).await?)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[BroadcastStatus],
        to: BroadcastStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.compare_and_set_status(id, from, to, at).await?)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        progress: &BroadcastProgress,
    ) -> Result<(), StoreError> {
        Ok(self.set_progress(id, progress).await?)
    }

    async fn record_outcome(&self, outcome: &RecipientOutcome) -> Result<(), StoreError> {
        Ok(self.insert_outcome(outcome).await?)
    }

    async fn outcomes(&self, id: Uuid) -> Result<Vec<RecipientOutcome>, StoreError> {
        self.find_outcomes(id)
            .await?
            .into_iter()
            .map(RecipientOutcome::try_from)
            .collect()
    }

    async fn find_scheduled_until(
        &self,
        until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Broadcast>, StoreError> {
        into_broadcasts(self.find_due(until, limit).await?)
    }

    async fn find_scheduled_for_device(&self, device_id: Uuid) -> Result<Vec<Broadcast>, StoreError> {
        into_broadcasts(self.find_scheduled_by_device(device_id).await?)
    }
}
