//! Handlers for the `/simulations` resource.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use qsim_core::simulation::SimulationRequest;
use qsim_core::types::JobId;
use qsim_db::models::job::JobListQuery;
use qsim_db::models::status::JobStatus;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::response::{
    ActiveJobsResponse, CancelResponse, EnergyHistoryResponse, JobListResponse, JobResponse,
    SubmitResponse,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a job id path segment.
pub(crate) fn parse_job_id(raw: &str) -> AppResult<JobId> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid job id '{raw}'")))
}

/// Query parameters for `GET /simulations`.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListParams {
    fn into_query(self) -> AppResult<JobListQuery> {
        let status = self
            .status
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<JobStatus>())
            .transpose()?;
        Ok(JobListQuery {
            status,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/simulations
///
/// Create a simulation job and dispatch it. Returns 201 immediately; the
/// job runs in the background.
pub async fn create_simulation(
    State(state): State<AppState>,
    payload: Result<Json<SimulationRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;
    let job = state.jobs.submit(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            message: "Simulation job created",
            job_id: job.id,
            status: job.status,
            status_url: format!("/api/v1/simulations/{}", job.id),
        }),
    ))
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// GET /api/v1/simulations/{id}
pub async fn get_simulation(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> AppResult<Json<JobResponse>> {
    let job = state.jobs.get(parse_job_id(&raw_id)?).await?;
    Ok(Json(JobResponse::from(job)))
}

/// GET /api/v1/simulations
///
/// Newest first. Supports `status`, `limit` (default 20, max 100) and
/// `offset`.
pub async fn list_simulations(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> AppResult<Json<JobListResponse>> {
    let Query(params) = params?;
    let query = params.into_query()?;
    let page = state.jobs.list(&query).await?;

    let limit = query.effective_limit();
    let offset = query.effective_offset();
    Ok(Json(JobListResponse {
        jobs: page.jobs,
        total: page.total,
        limit,
        offset,
        has_more: offset + limit < page.total,
    }))
}

/// GET /api/v1/simulations/{id}/energy-history
pub async fn get_energy_history(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> AppResult<Json<EnergyHistoryResponse>> {
    let job = state.jobs.get(parse_job_id(&raw_id)?).await?;
    Ok(Json(EnergyHistoryResponse {
        job_id: job.id,
        method: job.method,
        energy_history: job.energy_history.unwrap_or_default(),
        final_energy: job.result_energy,
        unit: "Hartree",
    }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// DELETE /api/v1/simulations/{id}
///
/// 409 if the job has already finished.
pub async fn cancel_simulation(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> AppResult<Json<CancelResponse>> {
    let job = state.jobs.cancel(parse_job_id(&raw_id)?).await?;
    Ok(Json(CancelResponse {
        message: "Job cancelled",
        job_id: job.id,
        status: job.status,
    }))
}

// ---------------------------------------------------------------------------
// Debug
// ---------------------------------------------------------------------------

/// GET /api/v1/simulations/debug/active
pub async fn active_simulations(State(state): State<AppState>) -> Json<ActiveJobsResponse> {
    let active_jobs = state.jobs.active_jobs();
    Json(ActiveJobsResponse {
        count: active_jobs.len(),
        active_jobs,
    })
}
