//! Sweep of overdue pairing sessions.

use domain::services::DeviceSessionManager;

use super::scheduler::{Job, JobFrequency};

/// Backs up the per-session deadline timers.
pub struct QrExpiryJob {
    sessions: DeviceSessionManager,
    sweep_secs: u64,
}

impl QrExpiryJob {
    pub fn new(sessions: DeviceSessionManager, sweep_secs: u64) -> Self {
        Self {
            sessions,
            sweep_secs,
        }
    }
}

#[async_trait::async_trait]
impl Job for QrExpiryJob {
    fn name(&self) -> &'static str {
        "qr_expiry"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Seconds(self.sweep_secs)
    }

    async fn execute(&self) -> Result<(), String> {
        let expired = self.sessions.expire_overdue().await;
        if expired > 0 {
            tracing::info!(expired, "Expired overdue pairing sessions");
        }
        Ok(())
    }
}
