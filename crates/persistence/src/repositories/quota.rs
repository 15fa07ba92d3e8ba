//! Quota counter repository.

use async_trait::async_trait;
use domain::models::{QuotaPeriod, ResourceKind};
use domain::store::{QuotaStore, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

use crate::metrics::QueryTimer;

/// Per-period usage counters, one row per (user, resource, period start).
#[derive(Clone)]
pub struct QuotaRepository {
    pool: PgPool,
}

impl QuotaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_count(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        period: &QuotaPeriod,
    ) -> Result<i64, sqlx::Error> {
        let count: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT count
            FROM quota_counters
            WHERE user_id = $1 AND resource = $2 AND period_start = $3
            "#,
        )
        .bind(user_id)
        .bind(resource.as_str())
        .bind(period.start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.map(|c| c.0).unwrap_or(0))
    }

    /// Single-statement upsert. The conditional `DO UPDATE` leaves the row
    /// untouched and returns nothing once the limit is reached, so
    /// concurrent callers can never overshoot.
    pub async fn increment_below(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        period: &QuotaPeriod,
        limit: Option<i64>,
    ) -> Result<Option<i64>, sqlx::Error> {
        if matches!(limit, Some(l) if l <= 0) {
            return Ok(None);
        }

        let timer = QueryTimer::new("increment_quota_counter");
        let result: Result<Option<(i64,)>, sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO quota_counters (user_id, resource, period_start, period_end, count, updated_at)
            VALUES ($1, $2, $3, $4, 1, NOW())
            ON CONFLICT (user_id, resource, period_start) DO UPDATE
            SET count = quota_counters.count + 1,
                updated_at = NOW()
            WHERE $5::BIGINT IS NULL OR quota_counters.count < $5::BIGINT
            RETURNING count
            "#,
        )
        .bind(user_id)
        .bind(resource.as_str())
        .bind(period.start)
        .bind(period.end)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await;
        timer.observe(&result);
        Ok(result?.map(|c| c.0))
    }
}

#[async_trait]
impl QuotaStore for QuotaRepository {
    async fn current(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        period: &QuotaPeriod,
    ) -> Result<i64, StoreError> {
        Ok(self.get_count(user_id, resource, period).await?)
    }

    async fn try_increment(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        period: &QuotaPeriod,
        limit: Option<i64>,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .increment_below(user_id, resource, period, limit)
            .await?)
    }
}
