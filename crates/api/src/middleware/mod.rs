//! HTTP middleware components.

pub mod logging;
pub mod metrics;
pub mod policy;
pub mod quota_gate;
pub mod rate_limit;
pub mod trace_id;
pub mod user_auth;

pub use metrics::{init_metrics, metrics_handler, metrics_middleware};
pub use policy::{require, Capability};
pub use quota_gate::quota_gate;
pub use rate_limit::{rate_limit_middleware, RateLimiterState};
pub use trace_id::{trace_id, RequestId, REQUEST_ID_HEADER};
pub use user_auth::{require_user_auth, UserAuth};
