//! Operations exposed to the API layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use qsim_core::simulation::SimulationRequest;
use qsim_core::types::JobId;
use qsim_db::models::job::{Job, JobListQuery, JobPage, NewJob};
use qsim_db::models::status::JobStatus;
use qsim_db::JobStore;
use qsim_events::{ProgressEvent, ProgressHub, ProgressSubscription};

use crate::error::EngineError;
use crate::manager::JobManager;
use crate::registry::ActiveJobInfo;

#[derive(Clone)]
pub struct JobService {
    manager: Arc<JobManager>,
}

impl JobService {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    fn store(&self) -> &Arc<dyn JobStore> {
        self.manager.store()
    }

    fn hub(&self) -> &Arc<ProgressHub> {
        self.manager.hub()
    }

    /// Validate, create a `Pending` record and dispatch it.
    ///
    /// Returns the record as created; the job runs in the background. If
    /// dispatch fails the record is moved to `Failed` before the error is
    /// returned.
    pub async fn submit(&self, request: SimulationRequest) -> Result<Job, EngineError> {
        request.validate_request()?;
        if !self.manager.solvers().contains(&request.method) {
            return Err(EngineError::Validation(format!(
                "Unknown method '{}'. Available methods: {}",
                request.method,
                self.manager.solvers().methods().join(", "),
            )));
        }

        let job = self.store().insert(&NewJob::from_request(&request)).await?;
        tracing::info!(
            job_id = %job.id,
            method = %job.method,
            molecule = %job.molecule_name,
            "Simulation job created",
        );

        if let Err(e) = self.manager.submit(job.id) {
            tracing::error!(job_id = %job.id, error = %e, "Failed to dispatch job");
            let reason = e.reason();
            let message = format!("Failed to start: {reason}");
            match self.store().fail(job.id, &message).await {
                Ok(true) => self.hub().publish(ProgressEvent::terminal(
                    job.id,
                    JobStatus::Failed,
                    Some(message),
                )),
                Ok(false) => {}
                Err(store_err) => {
                    tracing::error!(job_id = %job.id, error = %store_err, "Failed to record dispatch failure");
                }
            }
            return Err(EngineError::Dispatch {
                job_id: job.id,
                reason,
            });
        }

        Ok(job)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job, EngineError> {
        self.store()
            .find_by_id(job_id)
            .await?
            .ok_or(EngineError::NotFound(job_id))
    }

    pub async fn list(&self, query: &JobListQuery) -> Result<JobPage, EngineError> {
        Ok(self.store().list(query).await?)
    }

    /// Cancel a pending or running job.
    ///
    /// The record is moved to `Cancelled` first, then the worker (if any in
    /// this process) is signalled and the terminal event published.
    pub async fn cancel(&self, job_id: JobId) -> Result<Job, EngineError> {
        let job = self.get(job_id).await?;
        if job.is_terminal() {
            return Err(cannot_cancel(&job));
        }

        if !self.store().cancel(job_id).await? {
            // Lost a race with the worker's own terminal transition.
            let job = self.get(job_id).await?;
            return Err(cannot_cancel(&job));
        }

        let signalled = self.manager.cancel(job_id);
        self.hub()
            .publish(ProgressEvent::terminal(job_id, JobStatus::Cancelled, None));
        tracing::info!(job_id = %job_id, worker_signalled = signalled, "Simulation job cancelled");

        self.get(job_id).await
    }

    /// Subscribe to a job's progress events.
    ///
    /// For a job that has already finished the subscription yields a
    /// single terminal event describing the record.
    pub async fn subscribe(&self, job_id: JobId) -> Result<ProgressSubscription, EngineError> {
        // Attach before reading so a terminal event published in between
        // is not missed.
        let subscription = self.hub().subscribe(job_id);
        let finished = match self.get(job_id).await {
            Ok(job) => match ProgressEvent::terminal_for(&job) {
                Some(event) => ProgressSubscription::finished(event),
                None => return Ok(subscription),
            },
            Err(e) => {
                drop(subscription);
                self.hub().prune_idle(job_id);
                return Err(e);
            }
        };
        drop(subscription);
        self.hub().prune_idle(job_id);
        Ok(finished)
    }

    pub fn active_jobs(&self) -> BTreeMap<JobId, ActiveJobInfo> {
        self.manager.active_jobs()
    }
}

fn cannot_cancel(job: &Job) -> EngineError {
    EngineError::Conflict(format!("Cannot cancel job with status '{}'", job.status))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
