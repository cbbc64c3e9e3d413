//! Typed response bodies for the simulation endpoints.

use std::collections::BTreeMap;

use qsim_core::types::JobId;
use qsim_db::models::job::Job;
use qsim_db::models::status::JobStatus;
use qsim_engine::ActiveJobInfo;
use serde::Serialize;

/// `POST /api/v1/simulations` (201).
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub message: &'static str,
    pub job_id: JobId,
    pub status: JobStatus,
    pub status_url: String,
}

/// A job record, with the final energy in eV once completed.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_ev: Option<f64>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        let energy_ev = (job.status == JobStatus::Completed)
            .then(|| job.energy_ev())
            .flatten();
        Self { job, energy_ev }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub message: &'static str,
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct EnergyHistoryResponse {
    pub job_id: JobId,
    pub method: String,
    pub energy_history: Vec<f64>,
    pub final_energy: Option<f64>,
    pub unit: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ActiveJobsResponse {
    pub active_jobs: BTreeMap<JobId, ActiveJobInfo>,
    pub count: usize,
}
