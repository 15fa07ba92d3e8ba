//! Background job scheduler and job implementations.

mod due_broadcasts;
mod pool_metrics;
mod qr_expiry;
mod scheduler;

pub use due_broadcasts::DueBroadcastJob;
pub use pool_metrics::PoolMetricsJob;
pub use qr_expiry::QrExpiryJob;
pub use scheduler::{Job, JobFrequency, JobScheduler};
