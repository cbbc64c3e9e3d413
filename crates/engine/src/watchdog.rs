//! Maximum-duration policy layered on the active-job registry.
//!
//! On every tick, running jobs older than the limit are cancelled in the
//! manager and their records moved to `Failed`.

use std::sync::Arc;
use std::time::Duration;

use qsim_db::models::status::JobStatus;
use qsim_events::ProgressEvent;
use tokio_util::sync::CancellationToken;

use crate::manager::JobManager;

pub struct TimeoutWatchdog {
    manager: Arc<JobManager>,
    limit: Duration,
    interval: Duration,
}

impl TimeoutWatchdog {
    pub fn new(manager: Arc<JobManager>, limit: Duration, interval: Duration) -> Self {
        Self {
            manager,
            limit,
            interval,
        }
    }

    /// Run until `cancel` is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(
            limit_secs = self.limit.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Job timeout watchdog started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Job timeout watchdog stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let expired = self.sweep().await;
                    if expired > 0 {
                        tracing::warn!(expired, "Watchdog failed overdue jobs");
                    }
                }
            }
        }
    }

    /// One pass. Returns the number of records moved to `Failed`.
    pub async fn sweep(&self) -> usize {
        let message = format!("Job exceeded maximum duration of {:?}", self.limit);
        let mut expired = 0;

        for job_id in self.manager.registry().overdue(self.limit) {
            if !self.manager.cancel(job_id) {
                continue;
            }
            match self.manager.store().fail(job_id, &message).await {
                Ok(true) => {
                    expired += 1;
                    tracing::warn!(job_id = %job_id, "Job timed out");
                    self.manager.hub().publish(ProgressEvent::terminal(
                        job_id,
                        JobStatus::Failed,
                        Some(message.clone()),
                    ));
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job timeout");
                }
            }
        }
        expired
    }
}
