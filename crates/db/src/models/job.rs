//! Simulation job entity and the DTOs the store operates on.

use qsim_core::simulation::SimulationRequest;
use qsim_core::types::{new_job_id, JobId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use super::status::JobStatus;

/// Conversion factor from Hartree to electron-volts.
pub const HARTREE_TO_EV: f64 = 27.2114;

/// `current_step` written by the Completed transition.
pub const STEP_COMPLETE: &str = "Simulation complete";

/// Maximum page size for job listing.
pub const MAX_LIMIT: i64 = 100;

/// Default page size for job listing.
pub const DEFAULT_LIMIT: i64 = 20;

/// A row from the `simulation_jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: JobId,
    #[sqlx(try_from = "i16")]
    pub status: JobStatus,
    pub method: String,
    pub molecule_name: String,
    pub molecule_spec: serde_json::Value,
    pub config: serde_json::Value,
    pub progress: i16,
    pub current_step: String,
    /// Sequence number of the last persisted progress event.
    #[serde(skip)]
    pub progress_seq: i64,
    pub result_energy: Option<f64>,
    pub energy_history: Option<Vec<f64>>,
    pub result_metadata: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Final energy in eV, when the job has completed.
    pub fn energy_ev(&self) -> Option<f64> {
        self.result_energy.map(|e| e * HARTREE_TO_EV)
    }
}

/// Insert payload for a freshly submitted job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub method: String,
    pub molecule_name: String,
    pub molecule_spec: serde_json::Value,
    pub config: serde_json::Value,
}

impl NewJob {
    /// Build an insert payload with a newly allocated id.
    pub fn from_request(request: &SimulationRequest) -> Self {
        Self {
            id: new_job_id(),
            method: request.method.clone(),
            molecule_name: request.molecule_name(),
            molecule_spec: request.molecule.clone(),
            config: request.config.clone(),
        }
    }
}

/// Result fields written by the Completed transition.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub energy: f64,
    pub energy_history: Vec<f64>,
    pub metadata: serde_json::Value,
}

/// Filter and pagination for job listing.
#[derive(Debug, Clone, Default)]
pub struct JobListQuery {
    pub status: Option<JobStatus>,
    /// Defaults to [`DEFAULT_LIMIT`], capped at [`MAX_LIMIT`].
    pub limit: Option<i64>,
    /// Defaults to 0.
    pub offset: Option<i64>,
}

impl JobListQuery {
    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// One page of a listing plus the unpaginated match count.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: i64,
}

/// Outcome of a progress write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressWrite {
    /// The write was committed.
    Applied,
    /// A later event was already persisted; the job is still running.
    Stale,
    /// The job is not running (cancelled, finished, or unknown).
    Rejected,
}
