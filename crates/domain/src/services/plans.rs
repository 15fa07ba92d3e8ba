//! Plan limit lookup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::PlanLimits;

#[async_trait]
pub trait PlanRepository: Send + Sync {
    /// Limits of the user's active plan, `None` when the user has no plan.
    async fn get_limits(&self, user_id: Uuid) -> Result<Option<PlanLimits>, CoreError>;
}

/// Plan table held in memory.
#[derive(Debug, Default)]
pub struct FixedPlanRepository {
    plans: RwLock<HashMap<Uuid, PlanLimits>>,
}

impl FixedPlanRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_limits(&self, user_id: Uuid, limits: PlanLimits) {
        if let Ok(mut plans) = self.plans.write() {
            plans.insert(user_id, limits);
        }
    }
}

#[async_trait]
impl PlanRepository for FixedPlanRepository {
    async fn get_limits(&self, user_id: Uuid) -> Result<Option<PlanLimits>, CoreError> {
        let plans = self
            .plans
            .read()
            .map_err(|_| CoreError::Upstream("plan table unavailable".to_string()))?;
        Ok(plans.get(&user_id).copied())
    }
}
