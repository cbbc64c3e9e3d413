//! Job lifecycle status and the transition rules between states.
//!
//! Discriminants match the seed data of the `job_statuses` lookup table.
//!
//! ```text
//! Pending ──> Running ──> Completed
//!    │           │
//!    │           ├──────> Failed
//!    ├───────────┼──────> Failed
//!    └───────────┴──────> Cancelled
//! ```

use std::fmt;
use std::str::FromStr;

use qsim_core::error::CoreError;
use serde::{Deserialize, Serialize};

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

/// Background simulation job status.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending = 1,
    Running = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

/// Statuses from which a job may still move.
pub const ACTIVE_STATUSES: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Running];

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Return the database status ID.
    pub fn id(self) -> StatusId {
        self as StatusId
    }

    /// Look up a status by its database ID.
    pub fn from_id(id: StatusId) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, Failed and Cancelled admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Pending, Failed)
                | (Running, Failed)
                | (Pending, Cancelled)
                | (Running, Cancelled)
        )
    }
}

impl From<JobStatus> for StatusId {
    fn from(value: JobStatus) -> Self {
        value as StatusId
    }
}

impl TryFrom<StatusId> for JobStatus {
    type Error = CoreError;

    fn try_from(id: StatusId) -> Result<Self, Self::Error> {
        Self::from_id(id).ok_or_else(|| CoreError::Internal(format!("Unknown job status id {id}")))
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    /// Parse a status name, ignoring ASCII case (`"Failed"` and `"failed"`
    /// are equivalent).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CoreError::Validation(format!("Unknown job status: {s}")))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
