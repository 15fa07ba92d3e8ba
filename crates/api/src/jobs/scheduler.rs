//! Interval runner for background jobs.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How often a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFrequency {
    Seconds(u64),
    Minutes(u64),
}

impl JobFrequency {
    /// Interval between runs, never shorter than one second.
    pub fn duration(&self) -> Duration {
        let secs = match self {
            JobFrequency::Seconds(secs) => *secs,
            JobFrequency::Minutes(mins) => mins.saturating_mul(60),
        };
        Duration::from_secs(secs.max(1))
    }
}

#[async_trait::async_trait]
pub trait Job: Send + Sync {
    /// Used as the `job` field in logs and metrics.
    fn name(&self) -> &'static str;

    fn frequency(&self) -> JobFrequency;

    async fn execute(&self) -> Result<(), String>;
}

/// Runs each registered job on its own interval until shutdown.
///
/// A run that overlaps the next tick delays it instead of queueing extra
/// runs.
pub struct JobScheduler {
    jobs: Vec<Arc<dyn Job>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl JobScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn register<J: Job + 'static>(&mut self, job: J) {
        self.jobs.push(Arc::new(job));
    }

    pub fn start(&mut self) {
        info!(jobs = self.jobs.len(), "Starting job scheduler");

        for job in &self.jobs {
            let job = Arc::clone(job);
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.handles.push(tokio::spawn(run_job(job, shutdown_rx)));
        }
    }

    /// Signals every job loop to stop. Returns immediately.
    pub fn shutdown(&self) {
        info!("Initiating job scheduler shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for the job loops to exit, giving up after `timeout`.
    pub async fn wait_for_shutdown(self, timeout: Duration) {
        let all_done = async {
            for handle in self.handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Job task panicked");
                }
            }
        };

        match tokio::time::timeout(timeout, all_done).await {
            Ok(()) => info!("All jobs stopped"),
            Err(_) => warn!(timeout_ms = timeout.as_millis() as u64, "Job shutdown timed out"),
        }
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_job(job: Arc<dyn Job>, mut shutdown_rx: watch::Receiver<bool>) {
    let name = job.name();
    let mut interval = tokio::time::interval(job.frequency().duration());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    interval.tick().await;

    debug!(job = name, frequency = ?job.frequency(), "Job scheduled");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let start = Instant::now();
                let outcome = match job.execute().await {
                    Ok(()) => {
                        debug!(job = name, elapsed_ms = start.elapsed().as_millis() as u64, "Job completed");
                        "ok"
                    }
                    Err(e) => {
                        error!(job = name, elapsed_ms = start.elapsed().as_millis() as u64, error = %e, "Job failed");
                        "error"
                    }
                };
                metrics::counter!("background_job_runs_total", "job" => name, "outcome" => outcome)
                    .increment(1);
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(job = name, "Job shutting down");
                    break;
                }
            }
        }
    }
}
