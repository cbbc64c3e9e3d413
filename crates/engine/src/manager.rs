//! Job Manager: owns the active-job registry and decides whether and where
//! a submitted job's worker starts.

use std::collections::BTreeMap;
use std::sync::Arc;

use qsim_core::types::JobId;
use qsim_db::models::status::JobStatus;
use qsim_db::JobStore;
use qsim_events::{ProgressEvent, ProgressHub};
use qsim_solver::SolverRegistry;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{AdmissionPolicy, DispatchMode, EngineConfig};
use crate::error::EngineError;
use crate::registry::{ActiveJobInfo, JobRegistry};
use crate::worker::{Admission, ExecutionWorker, WorkerContext};

/// Message recorded on jobs interrupted by [`JobManager::shutdown`].
pub const SHUTDOWN_MESSAGE: &str = "Interrupted by server shutdown";

/// How a submission was handed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A worker was started in this process.
    Started,
    /// The record was left `Pending` for an external worker process.
    Enqueued,
}

/// An admission slot taken ahead of claiming a job.
#[derive(Debug)]
pub struct SlotReservation(Option<OwnedSemaphorePermit>);

pub struct JobManager {
    ctx: WorkerContext,
    registry: Arc<JobRegistry>,
    /// `None` when concurrency is unlimited.
    slots: Option<Arc<Semaphore>>,
    max_concurrent_jobs: usize,
    policy: AdmissionPolicy,
    mode: DispatchMode,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        solvers: Arc<SolverRegistry>,
        hub: Arc<ProgressHub>,
        config: &EngineConfig,
    ) -> Self {
        let slots = (config.max_concurrent_jobs > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_jobs)));
        Self {
            ctx: WorkerContext {
                store,
                solvers,
                hub,
            },
            registry: Arc::new(JobRegistry::new()),
            slots,
            max_concurrent_jobs: config.max_concurrent_jobs,
            policy: config.admission_policy,
            mode: config.dispatch_mode,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.ctx.store
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.ctx.hub
    }

    pub fn solvers(&self) -> &Arc<SolverRegistry> {
        &self.ctx.solvers
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.mode
    }

    /// Hand a freshly created `Pending` job to a worker according to the
    /// configured dispatch mode. Returns without waiting for the job.
    pub fn submit(&self, job_id: JobId) -> Result<Dispatched, EngineError> {
        match self.mode {
            DispatchMode::Queue => {
                tracing::debug!(job_id = %job_id, "Job left pending for queue consumers");
                Ok(Dispatched::Enqueued)
            }
            DispatchMode::Inline => self.start(job_id).map(|()| Dispatched::Started),
        }
    }

    /// Register `job_id` and start its worker in this process.
    ///
    /// Fails with `Conflict` if the job is already active and with
    /// `Dispatch` if admission is refused or no runtime is available. The
    /// caller owns the record transition on failure.
    pub fn start(&self, job_id: JobId) -> Result<(), EngineError> {
        let admission = match (&self.slots, self.policy) {
            (None, _) => Admission::Unlimited,
            (Some(slots), AdmissionPolicy::Reject) => {
                let permit = Arc::clone(slots).try_acquire_owned().map_err(|_| {
                    EngineError::Dispatch {
                        job_id,
                        reason: format!(
                            "concurrency limit of {} running jobs reached",
                            self.max_concurrent_jobs
                        ),
                    }
                })?;
                Admission::Granted(permit)
            }
            (Some(slots), AdmissionPolicy::Queue) => Admission::Wait(Arc::clone(slots)),
        };
        self.spawn_worker(job_id, admission)
    }

    /// Take a free admission slot, if any. Held slots are only returned
    /// once a worker finishes, so a cancelled job whose solver is still
    /// running keeps its slot.
    pub fn try_reserve(&self) -> Option<SlotReservation> {
        match &self.slots {
            None => Some(SlotReservation(None)),
            Some(slots) => Arc::clone(slots)
                .try_acquire_owned()
                .ok()
                .map(|permit| SlotReservation(Some(permit))),
        }
    }

    /// Start `job_id` on a slot taken with [`JobManager::try_reserve`].
    pub fn start_reserved(&self, job_id: JobId, slot: SlotReservation) -> Result<(), EngineError> {
        let admission = match slot.0 {
            Some(permit) => Admission::Granted(permit),
            None => Admission::Unlimited,
        };
        self.spawn_worker(job_id, admission)
    }

    fn spawn_worker(&self, job_id: JobId, admission: Admission) -> Result<(), EngineError> {
        let registration = self
            .registry
            .try_register(job_id)
            .map_err(|_| EngineError::Conflict(format!("Job {job_id} is already active")))?;

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| EngineError::Dispatch {
            job_id,
            reason: e.to_string(),
        })?;

        tracing::info!(
            job_id = %job_id,
            worker = registration.worker(),
            active = self.registry.len(),
            "Starting execution worker",
        );

        let worker = ExecutionWorker::new(self.ctx.clone(), registration, admission);
        runtime.spawn(worker.run());
        Ok(())
    }

    /// Remove `job_id` from the registry and signal its worker.
    ///
    /// Returns `false` if no worker in this process was tracking the job.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let signalled = self.registry.cancel(job_id);
        if signalled {
            tracing::info!(job_id = %job_id, "Cancellation signalled to worker");
        }
        signalled
    }

    pub fn active_jobs(&self) -> BTreeMap<JobId, ActiveJobInfo> {
        self.registry.snapshot()
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        self.registry.contains(job_id)
    }

    pub(crate) fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Signal every registered worker and fail their records.
    ///
    /// Returns the number of jobs interrupted.
    pub async fn shutdown(&self) -> usize {
        let interrupted = self.registry.cancel_all();
        for job_id in &interrupted {
            match self.ctx.store.fail(*job_id, SHUTDOWN_MESSAGE).await {
                Ok(true) => self.ctx.hub.publish(ProgressEvent::terminal(
                    *job_id,
                    JobStatus::Failed,
                    Some(SHUTDOWN_MESSAGE.to_string()),
                )),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record shutdown interruption");
                }
            }
        }
        if !interrupted.is_empty() {
            tracing::warn!(count = interrupted.len(), "Active jobs interrupted by shutdown");
        }
        interrupted.len()
    }
}
