//! Plan limits entity.

use domain::models::{PlanLimits, QuotaLimit};
use sqlx::FromRow;

/// Limit columns of the plan a user is on.
#[derive(Debug, Clone, FromRow)]
pub struct PlanLimitsEntity {
    pub messages_limit: Option<i64>,
    pub devices_limit: Option<i64>,
    pub api_requests_limit: Option<i64>,
}

impl From<PlanLimitsEntity> for PlanLimits {
    fn from(entity: PlanLimitsEntity) -> Self {
        Self {
            messages: QuotaLimit::from_plan_value(entity.messages_limit),
            devices: QuotaLimit::from_plan_value(entity.devices_limit),
            api_requests: QuotaLimit::from_plan_value(entity.api_requests_limit),
        }
    }
}
