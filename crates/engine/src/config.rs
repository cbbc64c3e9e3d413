use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use qsim_solver::{CommandSolver, SolverRegistry};

/// What happens to a submission that arrives while `max_concurrent_jobs`
/// jobs are already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Refuse it with a dispatch error; the record goes to `Failed`.
    Reject,
    /// Register it and let the worker wait for a free slot while the
    /// record stays `Pending`.
    Queue,
}

impl FromStr for AdmissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "queue" => Ok(Self::Queue),
            other => Err(format!("expected 'reject' or 'queue', got '{other}'")),
        }
    }
}

/// Where workers for submitted jobs run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// In this process, on the tokio runtime.
    Inline,
    /// In a separate `qsim-worker` process claiming pending records.
    Queue,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "queue" => Ok(Self::Queue),
            other => Err(format!("expected 'inline' or 'queue', got '{other}'")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid value for {key}: '{value}' ({reason})")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Job engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of jobs running at once; `0` means unlimited.
    pub max_concurrent_jobs: usize,
    pub admission_policy: AdmissionPolicy,
    /// Maximum running time before the watchdog fails a job; `None`
    /// disables the watchdog.
    pub job_timeout: Option<Duration>,
    /// How often the watchdog looks for overdue jobs.
    pub watchdog_interval: Duration,
    pub dispatch_mode: DispatchMode,
    /// Poll interval of the queue consumer.
    pub queue_poll_interval: Duration,
    /// Buffered events per progress channel before slow subscribers lag.
    pub progress_channel_capacity: usize,
    /// External solver program and arguments, whitespace separated.
    pub solver_command: Option<String>,
    /// Methods served by `solver_command`.
    pub solver_methods: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            admission_policy: AdmissionPolicy::Queue,
            job_timeout: Some(Duration::from_secs(3600)),
            watchdog_interval: Duration::from_secs(10),
            dispatch_mode: DispatchMode::Inline,
            queue_poll_interval: Duration::from_millis(1000),
            progress_channel_capacity: qsim_events::progress::DEFAULT_CAPACITY,
            solver_command: None,
            solver_methods: vec!["vqe".to_string(), "sqd".to_string()],
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default  |
    /// |-----------------------------|----------|
    /// | `MAX_CONCURRENT_JOBS`       | `5`      |
    /// | `ADMISSION_POLICY`          | `queue`  |
    /// | `JOB_TIMEOUT_SECS`          | `3600`   |
    /// | `WATCHDOG_INTERVAL_SECS`    | `10`     |
    /// | `DISPATCH_MODE`             | `inline` |
    /// | `QUEUE_POLL_INTERVAL_MS`    | `1000`   |
    /// | `PROGRESS_CHANNEL_CAPACITY` | `256`    |
    /// | `SOLVER_COMMAND`            | unset    |
    /// | `SOLVER_METHODS`            | `vqe,sqd`|
    ///
    /// `MAX_CONCURRENT_JOBS=0` lifts the limit, `JOB_TIMEOUT_SECS=0`
    /// disables the watchdog.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let job_timeout_secs: u64 = parse_var(&lookup, "JOB_TIMEOUT_SECS", 3600)?;
        let watchdog_interval_secs: u64 = parse_var(&lookup, "WATCHDOG_INTERVAL_SECS", 10)?;
        let queue_poll_interval_ms: u64 = parse_var(&lookup, "QUEUE_POLL_INTERVAL_MS", 1000)?;

        Ok(Self {
            max_concurrent_jobs: parse_var(&lookup, "MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?,
            admission_policy: parse_var(&lookup, "ADMISSION_POLICY", defaults.admission_policy)?,
            job_timeout: (job_timeout_secs > 0).then(|| Duration::from_secs(job_timeout_secs)),
            watchdog_interval: Duration::from_secs(watchdog_interval_secs.max(1)),
            dispatch_mode: parse_var(&lookup, "DISPATCH_MODE", defaults.dispatch_mode)?,
            queue_poll_interval: Duration::from_millis(queue_poll_interval_ms.max(10)),
            progress_channel_capacity: parse_var(
                &lookup,
                "PROGRESS_CHANNEL_CAPACITY",
                defaults.progress_channel_capacity,
            )?,
            solver_command: lookup("SOLVER_COMMAND")
                .map(|cmd| cmd.trim().to_string())
                .filter(|cmd| !cmd.is_empty()),
            solver_methods: match lookup("SOLVER_METHODS") {
                Some(list) => list
                    .split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect(),
                None => defaults.solver_methods,
            },
        })
    }

    /// Build the solver registry: every configured method is served by
    /// the external solver command. Empty when no command is set.
    pub fn solver_registry(&self) -> SolverRegistry {
        let mut registry = SolverRegistry::new();
        let Some(command) = &self.solver_command else {
            return registry;
        };
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return registry;
        };
        let solver = parts.fold(CommandSolver::new(program), |solver, arg| solver.arg(arg));
        let solver = Arc::new(solver);
        for method in &self.solver_methods {
            registry.register(method.clone(), solver.clone());
        }
        registry
    }
}

/// Parse `key` if set, otherwise return `default`.
pub fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError {
            key,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}
