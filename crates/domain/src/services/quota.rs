//! Quota enforcement over persisted monthly counters.
//!
//! `consume` is a single atomic increment-if-below-limit in the store.
//! Sends that may still fail take a [`QuotaPermit`] instead: the permit
//! holds an in-process reservation that counts against the limit, and only
//! `commit` touches the persisted counter. Dropping an uncommitted permit
//! gives the unit back.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::clock::Clock;
use super::plans::PlanRepository;
use crate::error::CoreError;
use crate::models::{PlanLimits, QuotaCheck, QuotaLimit, QuotaPeriod, ResourceKind};
use crate::store::QuotaStore;

type ReservationKey = (Uuid, ResourceKind, DateTime<Utc>);
type Ledger = Arc<Mutex<HashMap<ReservationKey, i64>>>;

#[derive(Debug, Clone)]
pub struct QuotaSettings {
    /// Limits for users without a plan.
    pub defaults: PlanLimits,
    /// Reference offset for month boundaries.
    pub offset: FixedOffset,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            defaults: PlanLimits {
                messages: QuotaLimit::Limited(1_000),
                devices: QuotaLimit::Limited(1),
                api_requests: QuotaLimit::Limited(10_000),
            },
            offset: Utc.fix(),
        }
    }
}

/// Reserved unit of a metered resource.
#[derive(Debug)]
pub struct QuotaPermit {
    user_id: Uuid,
    resource: ResourceKind,
    period: QuotaPeriod,
    limit: QuotaLimit,
    ledger: Option<Ledger>,
}

impl QuotaPermit {
    pub fn resource(&self) -> ResourceKind {
        self.resource
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        let Some(ledger) = self.ledger.take() else {
            return;
        };
        if let Ok(mut held) = ledger.lock() {
            let key = (self.user_id, self.resource, self.period.start);
            if let Some(count) = held.get_mut(&key) {
                *count -= 1;
                if *count <= 0 {
                    held.remove(&key);
                }
            }
        };
    }
}

struct QuotaInner {
    store: Arc<dyn QuotaStore>,
    plans: Arc<dyn PlanRepository>,
    clock: Arc<dyn Clock>,
    settings: QuotaSettings,
    reservations: Ledger,
}

/// Plan-based usage limits. Cheap to clone.
#[derive(Clone)]
pub struct QuotaEnforcer {
    inner: Arc<QuotaInner>,
}

impl QuotaEnforcer {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        plans: Arc<dyn PlanRepository>,
        clock: Arc<dyn Clock>,
        settings: QuotaSettings,
    ) -> Self {
        Self {
            inner: Arc::new(QuotaInner {
                store,
                plans,
                clock,
                settings,
                reservations: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// The accounting window containing the current instant.
    pub fn current_period(&self) -> QuotaPeriod {
        QuotaPeriod::containing(self.inner.clock.now(), self.inner.settings.offset)
    }

    pub async fn limit_for(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
    ) -> Result<QuotaLimit, CoreError> {
        let limits = self
            .inner
            .plans
            .get_limits(user_id)
            .await?
            .unwrap_or(self.inner.settings.defaults);
        Ok(limits.get(resource))
    }

    /// Reads usage without consuming anything.
    pub async fn check(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
    ) -> Result<QuotaCheck, CoreError> {
        let period = self.current_period();
        let limit = self.limit_for(user_id, resource).await?;
        let current = self.inner.store.current(user_id, resource, &period).await?;
        let held = self.held(user_id, resource, &period);

        Ok(QuotaCheck {
            resource,
            allowed: limit.allows(current + held),
            current,
            limit,
            period_start: period.start,
            period_end: period.end,
        })
    }

    /// Usage of every resource kind.
    pub async fn usage(&self, user_id: Uuid) -> Result<Vec<QuotaCheck>, CoreError> {
        let mut checks = Vec::with_capacity(ResourceKind::ALL.len());
        for resource in ResourceKind::ALL {
            checks.push(self.check(user_id, resource).await?);
        }
        Ok(checks)
    }

    /// Atomically takes one unit, or fails with `QuotaExceeded`.
    pub async fn consume(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
    ) -> Result<QuotaCheck, CoreError> {
        let period = self.current_period();
        let limit = self.limit_for(user_id, resource).await?;
        let held = self.held(user_id, resource, &period);
        let effective = limit.as_option().map(|l| (l - held).max(0));

        match self
            .inner
            .store
            .try_increment(user_id, resource, &period, effective)
            .await?
        {
            Some(count) => Ok(QuotaCheck {
                resource,
                allowed: true,
                current: count,
                limit,
                period_start: period.start,
                period_end: period.end,
            }),
            None => {
                let current = self.inner.store.current(user_id, resource, &period).await?;
                Err(self.denied(user_id, resource, current, limit))
            }
        }
    }

    /// Holds one unit for a send that has not happened yet.
    pub async fn reserve(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
    ) -> Result<QuotaPermit, CoreError> {
        let period = self.current_period();
        let limit = self.limit_for(user_id, resource).await?;

        let QuotaLimit::Limited(max) = limit else {
            return Ok(QuotaPermit {
                user_id,
                resource,
                period,
                limit,
                ledger: None,
            });
        };

        // Take the reservation first, then read the counter, so a commit
        // racing with us is seen at least once.
        let held = {
            let mut reservations = self
                .inner
                .reservations
                .lock()
                .map_err(|_| CoreError::Upstream("quota ledger poisoned".to_string()))?;
            let count = reservations
                .entry((user_id, resource, period.start))
                .or_insert(0);
            *count += 1;
            *count
        };
        let permit = QuotaPermit {
            user_id,
            resource,
            period,
            limit,
            ledger: Some(Arc::clone(&self.inner.reservations)),
        };

        let current = self.inner.store.current(user_id, resource, &period).await?;
        if current + held > max {
            return Err(self.denied(user_id, resource, current, limit));
        }
        Ok(permit)
    }

    /// Turns a reservation into a persisted unit. Returns the new count.
    pub async fn commit(&self, permit: QuotaPermit) -> Result<i64, CoreError> {
        let committed = self
            .inner
            .store
            .try_increment(
                permit.user_id,
                permit.resource,
                &permit.period,
                permit.limit.as_option(),
            )
            .await?;

        match committed {
            Some(count) => Ok(count),
            None => {
                let current = self
                    .inner
                    .store
                    .current(permit.user_id, permit.resource, &permit.period)
                    .await?;
                Err(self.denied(permit.user_id, permit.resource, current, permit.limit))
            }
        }
    }

    fn held(&self, user_id: Uuid, resource: ResourceKind, period: &QuotaPeriod) -> i64 {
        self.inner
            .reservations
            .lock()
            .ok()
            .and_then(|r| r.get(&(user_id, resource, period.start)).copied())
            .unwrap_or(0)
    }

    fn denied(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        current: i64,
        limit: QuotaLimit,
    ) -> CoreError {
        metrics::counter!("quota_denials_total", "resource" => resource.as_str()).increment(1);
        tracing::info!(user_id = %user_id, resource = %resource, current, limit = %limit, "Quota denied");
        CoreError::QuotaExceeded {
            resource,
            current,
            limit,
        }
    }
}
