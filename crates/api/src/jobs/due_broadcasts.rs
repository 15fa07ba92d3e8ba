//! Starts scheduled broadcasts whose timer was lost.

use domain::services::BroadcastScheduler;

use super::scheduler::{Job, JobFrequency};

/// Upper bound of broadcasts started per run.
const DUE_BATCH_SIZE: i64 = 100;

/// Covers timers that did not survive a restart. Dispatch start is a
/// compare-and-swap, so racing a live timer is harmless.
pub struct DueBroadcastJob {
    broadcasts: BroadcastScheduler,
    poll_secs: u64,
}

impl DueBroadcastJob {
    pub fn new(broadcasts: BroadcastScheduler, poll_secs: u64) -> Self {
        Self {
            broadcasts,
            poll_secs,
        }
    }
}

#[async_trait::async_trait]
impl Job for DueBroadcastJob {
    fn name(&self) -> &'static str {
        "due_broadcasts"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Seconds(self.poll_secs)
    }

    async fn execute(&self) -> Result<(), String> {
        let started = self
            .broadcasts
            .dispatch_due(DUE_BATCH_SIZE)
            .await
            .map_err(|e| e.to_string())?;
        if started > 0 {
            tracing::info!(started, "Dispatched overdue broadcasts");
        }
        Ok(())
    }
}
