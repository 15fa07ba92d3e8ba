//! Plan lookups for quota limits.

use async_trait::async_trait;
use domain::models::PlanLimits;
use domain::services::PlanRepository;
use domain::store::StoreError;
use domain::CoreError;
use sqlx::PgPool;
use uuid::Uuid;

use crate::entities::PlanLimitsEntity;

#[derive(Clone)]
pub struct PgPlanRepository {
    pool: PgPool,
}

impl PgPlanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Limits of the most recently started active plan of the user.
    pub async fn find_active_limits(
        &self,
        user_id: Uuid,
    ) -> Result<Option<PlanLimitsEntity>, sqlx::Error> {
        sqlx::query_as::<_, PlanLimitsEntity>(
            r#"
            SELECT p.messages_limit, p.devices_limit, p.api_requests_limit
            FROM user_plans up
            JOIN plans p ON p.id = up.plan_id
            WHERE up.user_id = $1 AND up.active = TRUE
            ORDER BY up.started_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[async_trait]
impl PlanRepository for PgPlanRepository {
    async fn get_limits(&self, user_id: Uuid) -> Result<Option<PlanLimits>, CoreError> {
        let limits = self
            .find_active_limits(user_id)
            .await
            .map_err(StoreError::from)?;
        Ok(limits.map(PlanLimits::from))
    }
}
