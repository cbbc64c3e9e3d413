//! Execution Worker: runs one job from `Pending` to a terminal state.
//!
//! Protocol:
//! 1. wait for an admission slot (queued policy only),
//! 2. `Pending -> Running`,
//! 3. build the solver input from the record,
//! 4. run the solver on a blocking thread, relaying each progress report
//!    to the progress hub and the record,
//! 5. `Running -> Completed` with results, or `-> Failed` with the error,
//! 6. deregister (the [`Registration`] drop guard, even on panic).
//!
//! Once the job's cancellation token fires the worker makes no further
//! record mutations; the store rejects any that race past the check.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use qsim_core::types::JobId;
use qsim_db::models::job::{JobOutcome, ProgressWrite, HARTREE_TO_EV, STEP_COMPLETE};
use qsim_db::models::status::JobStatus;
use qsim_db::JobStore;
use qsim_events::{ProgressEvent, ProgressHub};
use qsim_solver::{ProgressSink, SolverInput, SolverOutput, SolverProgress, SolverRegistry};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::registry::Registration;

/// Collaborators every worker needs.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub solvers: Arc<SolverRegistry>,
    pub hub: Arc<ProgressHub>,
}

/// Admission state handed to a worker by the manager.
pub(crate) enum Admission {
    Unlimited,
    /// A slot was reserved at submission time.
    Granted(OwnedSemaphorePermit),
    /// The worker must wait for a slot.
    Wait(Arc<Semaphore>),
}

pub(crate) struct ExecutionWorker {
    ctx: WorkerContext,
    registration: Registration,
    admission: Admission,
}

impl ExecutionWorker {
    pub(crate) fn new(ctx: WorkerContext, registration: Registration, admission: Admission) -> Self {
        Self {
            ctx,
            registration,
            admission,
        }
    }

    /// Run the full protocol. Never panics and never returns an error;
    /// every failure ends up on the job record.
    pub(crate) async fn run(self) {
        let job_id = self.registration.job_id();
        let span = tracing::info_span!("job", job_id = %job_id, worker = self.registration.worker());

        async move {
            let outcome = AssertUnwindSafe(self.execute()).catch_unwind().await;
            if let Err(panic) = outcome {
                let message = panic_message(panic.as_ref());
                tracing::error!(error = %message, "Execution worker panicked");
                if !self.registration.token().is_cancelled() {
                    self.fail_record(job_id, &format!("Internal error: {message}")).await;
                }
            }
            tracing::debug!("Execution worker finished");
            // `self.registration` drops here and deregisters the job.
        }
        .instrument(span)
        .await
    }

    async fn execute(&self) {
        let job_id = self.registration.job_id();
        let token = self.registration.token().clone();

        let _slot = match &self.admission {
            Admission::Wait(slots) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        tracing::info!("Job cancelled while waiting for an admission slot");
                        return;
                    }
                    permit = Arc::clone(slots).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            self.fail_record(job_id, "Admission control closed").await;
                            return;
                        }
                    },
                }
            }
            Admission::Unlimited | Admission::Granted(_) => None,
        };

        if token.is_cancelled() {
            return;
        }

        match self.ctx.store.mark_started(job_id).await {
            Ok(true) => self.registration.mark_running(),
            Ok(false) => {
                tracing::info!("Job is no longer pending, abandoning execution");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to mark job as running");
                self.fail_record(job_id, &format!("Failed to start: {e}")).await;
                return;
            }
        }

        let job = match self.ctx.store.find_by_id(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!("Job record disappeared after start");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load job record");
                self.fail_record(job_id, &format!("Failed to load job: {e}")).await;
                return;
            }
        };

        let Some(solver) = self.ctx.solvers.get(&job.method) else {
            self.fail_record(job_id, &format!("No solver registered for method '{}'", job.method))
                .await;
            return;
        };

        let input = SolverInput {
            job_id,
            method: job.method,
            molecule: job.molecule_spec,
            config: job.config,
        };

        tracing::info!(method = %input.method, "Solver run starting");
        let started = Instant::now();
        let (sink, mut reports) = ProgressSink::channel(token.clone());
        let mut handle = tokio::task::spawn_blocking(move || solver.run(&input, &sink));

        let mut seq: i64 = 0;
        let joined = loop {
            tokio::select! {
                biased;
                Some(report) = reports.recv() => self.relay(job_id, &mut seq, report, &token).await,
                joined = &mut handle => break joined,
            }
        };
        // The sink is gone with the solver; whatever it sent is buffered.
        while let Ok(report) = reports.try_recv() {
            self.relay(job_id, &mut seq, report, &token).await;
        }

        let elapsed = started.elapsed();
        match joined {
            Ok(Ok(output)) => self.complete(job_id, output, elapsed, &token).await,
            Ok(Err(e)) if token.is_cancelled() => {
                tracing::info!(error = %e, "Solver stopped after cancellation");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, elapsed_ms = elapsed.as_millis() as u64, "Solver failed");
                self.fail_record(job_id, &e.to_string()).await;
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    format!("Solver panicked: {}", panic_message(join_err.into_panic().as_ref()))
                } else {
                    format!("Solver task aborted: {join_err}")
                };
                tracing::error!(error = %message, "Solver task did not finish");
                if !token.is_cancelled() {
                    self.fail_record(job_id, &message).await;
                }
            }
        }
    }

    /// Relay one progress report to the hub and the record.
    ///
    /// Persistence failures are logged and do not stop the run. A rejected
    /// write means the record is no longer running (cancelled elsewhere),
    /// so the worker stops relaying.
    async fn relay(&self, job_id: JobId, seq: &mut i64, report: SolverProgress, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }

        *seq += 1;
        // 100 is reserved for the Completed transition.
        let percent = report.progress.clamp(0, 99) as i16;

        match self
            .ctx
            .store
            .update_progress(job_id, *seq, percent, &report.message)
            .await
        {
            Ok(ProgressWrite::Applied) | Ok(ProgressWrite::Stale) => {}
            Ok(ProgressWrite::Rejected) => {
                tracing::info!("Job record is no longer running, stopping progress relay");
                token.cancel();
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, progress = percent, "Failed to persist progress, continuing");
            }
        }

        self.ctx.hub.publish(ProgressEvent::progress(
            job_id,
            percent,
            report.message,
            report.energy,
        ));
    }

    async fn complete(&self, job_id: JobId, output: SolverOutput, elapsed: Duration, token: &CancellationToken) {
        if token.is_cancelled() {
            tracing::info!("Job was cancelled, discarding solver result");
            return;
        }

        let metadata = serde_json::json!({
            "energy_hartree": output.energy,
            "energy_ev": output.energy * HARTREE_TO_EV,
            "converged": output.converged,
            "num_iterations": output.num_iterations,
            "execution_time_seconds": elapsed.as_secs_f64(),
            "metadata": output.metadata,
        });
        let outcome = JobOutcome {
            energy: output.energy,
            energy_history: output.energy_history,
            metadata,
        };

        match self.ctx.store.complete(job_id, &outcome).await {
            Ok(true) => {
                tracing::info!(
                    energy = outcome.energy,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job completed",
                );
                self.ctx.hub.publish(ProgressEvent::progress(
                    job_id,
                    100,
                    STEP_COMPLETE,
                    Some(outcome.energy),
                ));
                self.ctx
                    .hub
                    .publish(ProgressEvent::terminal(job_id, JobStatus::Completed, None));
            }
            Ok(false) => {
                tracing::info!("Job record is no longer running, discarding solver result");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist job result");
                self.fail_record(job_id, &format!("Failed to persist result: {e}")).await;
            }
        }
    }

    /// `Pending|Running -> Failed`, publishing the terminal event if applied.
    async fn fail_record(&self, job_id: JobId, message: &str) {
        match self.ctx.store.fail(job_id, message).await {
            Ok(true) => {
                tracing::info!(error = message, "Job failed");
                self.ctx.hub.publish(ProgressEvent::terminal(
                    job_id,
                    JobStatus::Failed,
                    Some(message.to_string()),
                ));
            }
            Ok(false) => {
                tracing::debug!("Job already terminal, failure not recorded");
            }
            Err(e) => {
                tracing::error!(error = %e, failure = message, "Failed to record job failure");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
