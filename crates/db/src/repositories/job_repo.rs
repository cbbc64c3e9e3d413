//! Repository for the `simulation_jobs` table.
//!
//! Every status change is a single guarded `UPDATE ... WHERE status IN (...)`
//! so concurrent writers can never move a job out of a terminal state. The
//! boolean results report whether the transition was applied.

use qsim_core::types::JobId;
use sqlx::PgPool;

use crate::models::job::{Job, JobListQuery, JobOutcome, JobPage, NewJob, ProgressWrite, STEP_COMPLETE};
use crate::models::status::{JobStatus, StatusId};

/// Column list for `simulation_jobs` queries.
const COLUMNS: &str = "\
    id, status, method, molecule_name, molecule_spec, config, \
    progress, current_step, progress_seq, \
    result_energy, energy_history, result_metadata, error_message, \
    created_at, claimed_at, started_at, completed_at";

/// Statuses a job can still leave: pending, running.
const ACTIVE_STATUS_IDS: [StatusId; 2] = [JobStatus::Pending as StatusId, JobStatus::Running as StatusId];

/// Provides persistence operations for simulation jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new pending job and return the stored row.
    pub async fn insert(pool: &PgPool, input: &NewJob) -> Result<Job, sqlx::Error> {
        let query = format!(
            "INSERT INTO simulation_jobs (id, status, method, molecule_name, molecule_spec, config) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(input.id)
            .bind(JobStatus::Pending.id())
            .bind(&input.method)
            .bind(&input.molecule_name)
            .bind(&input.molecule_spec)
            .bind(&input.config)
            .fetch_one(pool)
            .await
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM simulation_jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List jobs newest first, with an optional status filter.
    ///
    /// `total` counts every job matching the filter, ignoring pagination.
    pub async fn list(pool: &PgPool, params: &JobListQuery) -> Result<JobPage, sqlx::Error> {
        let limit = params.effective_limit();
        let offset = params.effective_offset();
        let status_id = params.status.map(JobStatus::id);

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM simulation_jobs WHERE ($1::SMALLINT IS NULL OR status = $1)",
        )
        .bind(status_id)
        .fetch_one(pool)
        .await?;

        let query = format!(
            "SELECT {COLUMNS} FROM simulation_jobs \
             WHERE ($1::SMALLINT IS NULL OR status = $1) \
             ORDER BY created_at DESC \
             LIMIT $2 OFFSET $3"
        );
        let jobs = sqlx::query_as::<_, Job>(&query)
            .bind(status_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?;

        Ok(JobPage { jobs, total })
    }

    /// Transition Pending -> Running and set `started_at`.
    pub async fn mark_started(pool: &PgPool, id: JobId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE simulation_jobs SET status = $2, started_at = NOW() \
             WHERE id = $1 AND status = $3",
        )
        .bind(id)
        .bind(JobStatus::Running.id())
        .bind(JobStatus::Pending.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically claim the oldest unclaimed pending job.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent queue consumers
    /// never claim the same job. The job stays pending until its worker
    /// starts it.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE simulation_jobs \
             SET claimed_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM simulation_jobs \
                 WHERE status = $1 AND claimed_at IS NULL \
                 ORDER BY created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Persist a progress event for a running job.
    ///
    /// Writes whose `seq` is not newer than the stored one are dropped, and
    /// the stored percentage never decreases.
    pub async fn update_progress(
        pool: &PgPool,
        id: JobId,
        seq: i64,
        percent: i16,
        step: &str,
    ) -> Result<ProgressWrite, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE simulation_jobs \
             SET progress = GREATEST(progress, $3), current_step = $4, progress_seq = $2 \
             WHERE id = $1 AND status = $5 AND progress_seq < $2",
        )
        .bind(id)
        .bind(seq)
        .bind(percent)
        .bind(step)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(ProgressWrite::Applied);
        }

        let status: Option<StatusId> =
            sqlx::query_scalar("SELECT status FROM simulation_jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await?;

        Ok(match status.and_then(JobStatus::from_id) {
            Some(JobStatus::Running) => ProgressWrite::Stale,
            _ => ProgressWrite::Rejected,
        })
    }

    /// Transition Running -> Completed with the solver's results.
    pub async fn complete(pool: &PgPool, id: JobId, outcome: &JobOutcome) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE simulation_jobs \
             SET status = $2, completed_at = NOW(), progress = 100, current_step = $3, \
                 result_energy = $4, energy_history = $5, result_metadata = $6 \
             WHERE id = $1 AND status = $7",
        )
        .bind(id)
        .bind(JobStatus::Completed.id())
        .bind(STEP_COMPLETE)
        .bind(outcome.energy)
        .bind(&outcome.energy_history)
        .bind(&outcome.metadata)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transition Pending|Running -> Failed with an error message.
    pub async fn fail(pool: &PgPool, id: JobId, error: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE simulation_jobs \
             SET status = $2, error_message = $3, completed_at = NOW() \
             WHERE id = $1 AND status IN ($4, $5)",
        )
        .bind(id)
        .bind(JobStatus::Failed.id())
        .bind(error)
        .bind(ACTIVE_STATUS_IDS[0])
        .bind(ACTIVE_STATUS_IDS[1])
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transition Pending|Running -> Cancelled.
    ///
    /// Returns `false` if the job is already terminal (or does not exist).
    pub async fn cancel(pool: &PgPool, id: JobId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE simulation_jobs \
             SET status = $2, completed_at = NOW() \
             WHERE id = $1 AND status IN ($3, $4)",
        )
        .bind(id)
        .bind(JobStatus::Cancelled.id())
        .bind(ACTIVE_STATUS_IDS[0])
        .bind(ACTIVE_STATUS_IDS[1])
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
