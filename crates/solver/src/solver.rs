use qsim_core::types::JobId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything a solver needs to compute one job. Built from the job
/// record's immutable fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverInput {
    pub job_id: JobId,
    pub method: String,
    pub molecule: Value,
    pub config: Value,
}

/// Successful result of a solver run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOutput {
    /// Final energy in Hartree.
    pub energy: f64,
    /// Energy per iteration, in order.
    #[serde(default)]
    pub energy_history: Vec<f64>,
    #[serde(default)]
    pub converged: bool,
    #[serde(default)]
    pub num_iterations: u32,
    /// Opaque, method-specific details.
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Errors a solver may raise.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("{0}")]
    Failed(String),

    #[error("Solver run was cancelled")]
    Cancelled,

    #[error("Solver I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Solver protocol error: {0}")]
    Protocol(String),

    #[error("Solver exited with code {code}: {stderr}")]
    ExitStatus { code: i32, stderr: String },
}

/// One progress report from a running solver.
///
/// `progress` is advisory and not validated here.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverProgress {
    pub progress: i32,
    pub message: String,
    pub energy: Option<f64>,
}

/// Handle given to a solver for reporting progress and observing
/// cancellation.
///
/// Reporting never blocks: reports are queued on an unbounded channel
/// drained by the execution worker.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<SolverProgress>,
    token: CancellationToken,
}

impl ProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<SolverProgress>, token: CancellationToken) -> Self {
        Self { tx, token }
    }

    /// Create a sink together with the receiving end of its report queue.
    pub fn channel(token: CancellationToken) -> (Self, mpsc::UnboundedReceiver<SolverProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, token), rx)
    }

    pub fn report(&self, progress: i32, message: impl Into<String>, energy: Option<f64>) {
        // The receiver is gone once the worker stopped relaying.
        let _ = self.tx.send(SolverProgress {
            progress,
            message: message.into(),
            energy,
        });
    }

    /// Cooperative cancellation checkpoint.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the job is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// A numerical method the engine can run.
///
/// `run` is synchronous and may take from seconds to hours; the engine
/// calls it on a blocking thread.
pub trait Solver: Send + Sync {
    fn run(&self, input: &SolverInput, sink: &ProgressSink) -> Result<SolverOutput, SolverError>;
}
