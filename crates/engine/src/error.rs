use qsim_core::error::CoreError;
use qsim_core::types::JobId;

/// Errors returned by the job manager and [`JobService`](crate::JobService).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The job record exists but no worker could be started for it. The
    /// record has been moved to `Failed`.
    #[error("Failed to dispatch job {job_id}: {reason}")]
    Dispatch { job_id: JobId, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The cause of a dispatch failure without its job prefix; the full
    /// message for every other kind.
    pub fn reason(&self) -> String {
        match self {
            Self::Dispatch { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::Validation(msg),
            CoreError::Internal(msg) => Self::Internal(msg),
        }
    }
}
