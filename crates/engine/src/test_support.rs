//! Stub solvers and harness helpers shared by the engine tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qsim_core::simulation::SimulationRequest;
use qsim_core::types::JobId;
use qsim_db::models::job::Job;
use qsim_db::{JobStore, MemoryJobStore};
use qsim_events::ProgressHub;
use qsim_solver::{ProgressSink, Solver, SolverError, SolverInput, SolverOutput, SolverRegistry};

use crate::config::EngineConfig;
use crate::manager::JobManager;
use crate::service::JobService;

pub const STUB_ENERGY: f64 = -1.137;

/// Emits `steps` progress events then succeeds with [`STUB_ENERGY`].
pub struct StubSolver {
    pub steps: usize,
    pub delay: Duration,
}

impl Solver for StubSolver {
    fn run(&self, _input: &SolverInput, sink: &ProgressSink) -> Result<SolverOutput, SolverError> {
        let mut history = Vec::with_capacity(self.steps);
        for i in 1..=self.steps {
            if sink.is_cancelled() {
                return Err(SolverError::Cancelled);
            }
            std::thread::sleep(self.delay);
            let energy = STUB_ENERGY + 0.1 / i as f64;
            history.push(energy);
            sink.report((i * 100 / self.steps) as i32, format!("Iteration {i}"), Some(energy));
        }
        if let Some(last) = history.last_mut() {
            *last = STUB_ENERGY;
        }
        Ok(SolverOutput {
            energy: STUB_ENERGY,
            energy_history: history,
            converged: true,
            num_iterations: self.steps as u32,
            metadata: serde_json::json!({ "stub": true }),
        })
    }
}

pub struct FailingSolver;

impl Solver for FailingSolver {
    fn run(&self, _input: &SolverInput, sink: &ProgressSink) -> Result<SolverOutput, SolverError> {
        sink.report(10, "Building Hamiltonian", None);
        Err(SolverError::Failed("SCF did not converge".to_string()))
    }
}

pub struct PanickingSolver;

impl Solver for PanickingSolver {
    fn run(&self, _input: &SolverInput, _sink: &ProgressSink) -> Result<SolverOutput, SolverError> {
        panic!("matrix is singular");
    }
}

/// Reports progress every few milliseconds until released or cancelled.
#[derive(Default)]
pub struct GatedSolver {
    pub release: Arc<AtomicBool>,
}

impl Solver for GatedSolver {
    fn run(&self, _input: &SolverInput, sink: &ProgressSink) -> Result<SolverOutput, SolverError> {
        let mut tick = 0;
        while !self.release.load(Ordering::Acquire) {
            if sink.is_cancelled() {
                return Err(SolverError::Cancelled);
            }
            tick = (tick + 1) % 100;
            sink.report(tick, "Waiting", None);
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(SolverOutput {
            energy: -2.0,
            energy_history: vec![-2.0],
            converged: true,
            num_iterations: 1,
            metadata: serde_json::json!({}),
        })
    }
}

/// Like [`GatedSolver`] but never looks at the cancellation token.
#[derive(Default)]
pub struct StubbornSolver {
    pub release: Arc<AtomicBool>,
}

impl Solver for StubbornSolver {
    fn run(&self, _input: &SolverInput, _sink: &ProgressSink) -> Result<SolverOutput, SolverError> {
        while !self.release.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(SolverOutput {
            energy: -3.0,
            energy_history: vec![-3.0],
            converged: true,
            num_iterations: 1,
            metadata: serde_json::json!({}),
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub hub: Arc<ProgressHub>,
    pub manager: Arc<JobManager>,
    pub service: JobService,
    pub release: Arc<AtomicBool>,
}

/// Registry with methods `stub`, `fail`, `panic`, `gated`, `stubborn` and
/// `slow`.
pub fn solvers(release: &Arc<AtomicBool>) -> SolverRegistry {
    SolverRegistry::new()
        .with(
            "stub",
            Arc::new(StubSolver {
                steps: 10,
                delay: Duration::from_millis(1),
            }),
        )
        .with(
            "slow",
            Arc::new(StubSolver {
                steps: 200,
                delay: Duration::from_millis(10),
            }),
        )
        .with("fail", Arc::new(FailingSolver))
        .with("panic", Arc::new(PanickingSolver))
        .with(
            "gated",
            Arc::new(GatedSolver {
                release: Arc::clone(release),
            }),
        )
        .with(
            "stubborn",
            Arc::new(StubbornSolver {
                release: Arc::clone(release),
            }),
        )
}

pub fn harness(config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    harness_with_store(store.clone(), store, config)
}

pub fn harness_with_store(
    store: Arc<MemoryJobStore>,
    job_store: Arc<dyn JobStore>,
    config: EngineConfig,
) -> Harness {
    let release = Arc::new(AtomicBool::new(false));
    let hub = Arc::new(ProgressHub::new(config.progress_channel_capacity));
    let manager = Arc::new(JobManager::new(
        job_store,
        Arc::new(solvers(&release)),
        Arc::clone(&hub),
        &config,
    ));
    Harness {
        store,
        hub,
        service: JobService::new(Arc::clone(&manager)),
        manager,
        release,
    }
}

pub fn request(method: &str) -> SimulationRequest {
    serde_json::from_value(serde_json::json!({
        "method": method,
        "molecule": {
            "name": "H2",
            "atoms": [
                { "symbol": "H", "position": [0.0, 0.0, 0.0] },
                { "symbol": "H", "position": [0.0, 0.0, 0.74] },
            ],
        },
        "config": { "steps": 10 },
    }))
    .expect("valid request")
}

/// Poll the store until `predicate` holds, panicking after five seconds.
pub async fn wait_for_job(store: &dyn JobStore, job_id: JobId, predicate: impl Fn(&Job) -> bool) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = store
            .find_by_id(job_id)
            .await
            .expect("store read")
            .expect("job exists");
        if predicate(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {job_id}, last status {}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_terminal(store: &dyn JobStore, job_id: JobId) -> Job {
    wait_for_job(store, job_id, Job::is_terminal).await
}

/// Wait until the manager no longer tracks `job_id`.
pub async fn wait_until_inactive(manager: &JobManager, job_id: JobId) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.is_active(job_id) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} never left the registry"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
