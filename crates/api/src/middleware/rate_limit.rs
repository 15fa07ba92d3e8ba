//! Per-user request rate limiting.
//!
//! A short-window ceiling in front of the monthly `api_requests` quota.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovRateLimiter,
};
use std::{
    collections::HashMap,
    num::NonZeroU32,
    sync::{Arc, RwLock},
};
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::user_auth::UserAuth;

type UserRateLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// One limiter per user, created on first use.
pub struct RateLimiterState {
    limiters: RwLock<HashMap<Uuid, Arc<UserRateLimiter>>>,
    quota: Quota,
    clock: DefaultClock,
}

impl RateLimiterState {
    /// Returns `None` when `per_minute` is zero (limiting disabled).
    pub fn new(per_minute: u32) -> Option<Self> {
        let per_minute = NonZeroU32::new(per_minute)?;
        Some(Self {
            limiters: RwLock::new(HashMap::new()),
            quota: Quota::per_minute(per_minute),
            clock: DefaultClock::default(),
        })
    }

    fn limiter_for(&self, user_id: Uuid) -> Arc<UserRateLimiter> {
        if let Ok(limiters) = self.limiters.read() {
            if let Some(limiter) = limiters.get(&user_id) {
                return Arc::clone(limiter);
            }
        }

        let fresh = || Arc::new(GovRateLimiter::direct(self.quota));
        match self.limiters.write() {
            Ok(mut limiters) => Arc::clone(limiters.entry(user_id).or_insert_with(fresh)),
            // A poisoned map still limits, just without sharing state
            Err(_) => fresh(),
        }
    }

    /// `Err` carries the retry-after hint in seconds.
    pub fn check(&self, user_id: Uuid) -> Result<(), u64> {
        self.limiter_for(user_id)
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()).as_secs().max(1))
    }

    pub fn tracked_users(&self) -> usize {
        self.limiters.read().map(|l| l.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for RateLimiterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterState")
            .field("tracked_users", &self.tracked_users())
            .finish()
    }
}

/// Must run after [`super::require_user_auth`].
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let (Some(limiter), Some(auth)) = (&state.rate_limiter, req.extensions().get::<UserAuth>())
    {
        if let Err(retry_after_secs) = limiter.check(auth.user_id) {
            tracing::debug!(user_id = %auth.user_id, retry_after_secs, "Rate limited");
            return ApiError::RateLimited { retry_after_secs }.into_response();
        }
    }

    next.run(req).await
}
