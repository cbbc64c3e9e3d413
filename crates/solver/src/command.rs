//! External-process solver adapter.
//!
//! The child receives the [`SolverInput`] as JSON on stdin and writes one
//! JSON object per line to stdout:
//!
//! ```text
//! {"type":"progress","progress":40,"message":"iteration 4","energy":-1.02}
//! {"type":"error","message":"SCF did not converge"}
//! {"type":"result","energy":-1.137,"energy_history":[...],"converged":true,"num_iterations":10,"metadata":{}}
//! ```
//!
//! Lines that do not start with `{` are treated as log output and ignored.
//! The child is killed as soon as the job is cancelled.

use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

use crate::solver::{ProgressSink, Solver, SolverError, SolverInput, SolverOutput};

/// Maximum stderr captured for error reporting (64 KiB).
///
/// Anything beyond is read and discarded so the child never blocks on a
/// full pipe.
const MAX_STDERR_BYTES: u64 = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SolverMessage {
    Progress {
        progress: i32,
        #[serde(default)]
        message: String,
        #[serde(default)]
        energy: Option<f64>,
    },
    Error {
        message: String,
    },
    Result(SolverOutput),
}

/// Runs an external program per job.
#[derive(Debug, Clone)]
pub struct CommandSolver {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandSolver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn spawn(&self, input: &SolverInput) -> Result<Child, SolverError> {
        let mut cmd = Command::new(&self.program);
        // The child must not outlive the run.
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("QSIM_JOB_ID", input.job_id.to_string())
            .env("QSIM_METHOD", &input.method)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd.spawn()?)
    }

    async fn run_child(&self, input: &SolverInput, sink: &ProgressSink) -> Result<SolverOutput, SolverError> {
        let payload = serde_json::to_vec(input)
            .map_err(|e| SolverError::Protocol(format!("Cannot encode solver input: {e}")))?;

        let mut child = self.spawn(input)?;
        tracing::debug!(
            job_id = %input.job_id,
            program = %self.program.display(),
            pid = ?child.id(),
            "Solver process started",
        );

        // Stdin is written on its own task so a child that writes before it
        // reads cannot stall the stdout reader. The child may exit without
        // reading it.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = stdin.write_all(&payload).await;
            });
        }
        let stderr_task = tokio::spawn(read_stderr(child.stderr.take()));

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return Err(SolverError::Protocol("Solver stdout not captured".to_string()));
        };

        let read = tokio::select! {
            biased;
            () = sink.cancelled() => Err(SolverError::Cancelled),
            read = read_messages(stdout, input, sink) => read,
        };
        let output = match read {
            Ok(output) => output,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        // Stdout is closed, but the child may linger.
        let status = tokio::select! {
            biased;
            () = sink.cancelled() => None,
            status = child.wait() => Some(status?),
        };
        let Some(status) = status else {
            let _ = child.kill().await;
            return Err(SolverError::Cancelled);
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(SolverError::ExitStatus {
                code: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }
        output.ok_or_else(|| SolverError::Protocol("Solver exited without a result".to_string()))
    }
}

impl Solver for CommandSolver {
    /// Drives the child on the caller's runtime when there is one (the
    /// engine calls this from `spawn_blocking`), otherwise on a private
    /// current-thread runtime.
    fn run(&self, input: &SolverInput, sink: &ProgressSink) -> Result<SolverOutput, SolverError> {
        if sink.is_cancelled() {
            return Err(SolverError::Cancelled);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(self.run_child(input, sink)),
            Err(_) => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(self.run_child(input, sink)),
        }
    }
}

/// Read stdout until EOF, relaying progress and collecting the result.
///
/// Returns `Err` as soon as the run should be abandoned; the caller kills
/// the child in that case.
async fn read_messages(
    stdout: ChildStdout,
    input: &SolverInput,
    sink: &ProgressSink,
) -> Result<Option<SolverOutput>, SolverError> {
    let mut lines = BufReader::new(stdout).lines();
    let mut result = None;
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            if !trimmed.is_empty() {
                tracing::trace!(job_id = %input.job_id, line = trimmed, "Solver output");
            }
            continue;
        }

        let message: SolverMessage = serde_json::from_str(trimmed)
            .map_err(|e| SolverError::Protocol(format!("Invalid solver message: {e}")))?;
        match message {
            SolverMessage::Progress {
                progress,
                message,
                energy,
            } => sink.report(progress, message, energy),
            SolverMessage::Error { message } => return Err(SolverError::Failed(message)),
            SolverMessage::Result(output) => result = Some(output),
        }
    }
    Ok(result)
}

/// Capture the head of stderr, draining the rest.
async fn read_stderr<R: AsyncRead + Unpin>(handle: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h).take(MAX_STDERR_BYTES).read_to_end(&mut buf).await;
        let _ = tokio::io::copy(&mut h, &mut tokio::io::sink()).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
