//! Queue consumer for the `queue` dispatch mode.
//!
//! Polls for unclaimed pending records every `poll_interval` and starts
//! them on a local manager. [`JobStore::claim_next`] guarantees two
//! consumers never take the same job.
//!
//! [`JobStore::claim_next`]: qsim_db::JobStore::claim_next

use std::sync::Arc;
use std::time::Duration;

use qsim_db::models::status::JobStatus;
use qsim_events::ProgressEvent;
use tokio_util::sync::CancellationToken;

use crate::manager::JobManager;

pub struct QueueConsumer {
    manager: Arc<JobManager>,
    poll_interval: Duration,
}

impl QueueConsumer {
    pub fn new(manager: Arc<JobManager>, poll_interval: Duration) -> Self {
        Self {
            manager,
            poll_interval,
        }
    }

    /// Run the consumer loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Queue consumer started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Queue consumer shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "Queue poll failed");
                    }
                }
            }
        }
    }

    /// Claim and start jobs while local capacity allows. Returns the number
    /// of jobs started.
    ///
    /// A slot is reserved before each claim, so a job is only taken off the
    /// queue when it can start right away.
    pub async fn poll_once(&self) -> Result<usize, sqlx::Error> {
        let mut started = 0;

        while let Some(slot) = self.manager.try_reserve() {
            let Some(job) = self.manager.store().claim_next().await? else {
                break;
            };
            tracing::info!(job_id = %job.id, method = %job.method, "Job claimed from queue");

            if let Err(e) = self.manager.start_reserved(job.id, slot) {
                tracing::error!(job_id = %job.id, error = %e, "Failed to start claimed job");
                let message = format!("Failed to start: {}", e.reason());
                if self.manager.store().fail(job.id, &message).await? {
                    self.manager.hub().publish(ProgressEvent::terminal(
                        job.id,
                        JobStatus::Failed,
                        Some(message),
                    ));
                }
                continue;
            }
            started += 1;
        }

        Ok(started)
    }
}
