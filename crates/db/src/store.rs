//! The [`JobStore`] seam between the job engine and record persistence.

use async_trait::async_trait;
use qsim_core::types::JobId;

use crate::models::job::{Job, JobListQuery, JobOutcome, JobPage, NewJob, ProgressWrite};
use crate::repositories::JobRepo;
use crate::DbPool;

/// Convenience alias for store operation results.
pub type StoreResult<T> = Result<T, sqlx::Error>;

/// Durable job record store.
///
/// Mutations enforce the status state machine themselves and report
/// whether they applied; callers never read-modify-write a status.
/// Shared as `Arc<dyn JobStore>`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `Pending`.
    async fn insert(&self, job: &NewJob) -> StoreResult<Job>;

    async fn find_by_id(&self, id: JobId) -> StoreResult<Option<Job>>;

    /// Newest-first listing with an optional status filter.
    async fn list(&self, query: &JobListQuery) -> StoreResult<JobPage>;

    /// Pending -> Running. `false` if the job was not pending.
    async fn mark_started(&self, id: JobId) -> StoreResult<bool>;

    /// Claim the oldest unclaimed pending job for an external worker.
    async fn claim_next(&self) -> StoreResult<Option<Job>>;

    /// Persist a progress event for a running job.
    async fn update_progress(
        &self,
        id: JobId,
        seq: i64,
        percent: i16,
        step: &str,
    ) -> StoreResult<ProgressWrite>;

    /// Running -> Completed. `false` if the job was not running.
    async fn complete(&self, id: JobId, outcome: &JobOutcome) -> StoreResult<bool>;

    /// Pending|Running -> Failed. `false` if the job was already terminal.
    async fn fail(&self, id: JobId, error: &str) -> StoreResult<bool>;

    /// Pending|Running -> Cancelled. `false` if the job was already terminal.
    async fn cancel(&self, id: JobId) -> StoreResult<bool>;
}

/// PostgreSQL-backed store delegating to [`JobRepo`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &NewJob) -> StoreResult<Job> {
        JobRepo::insert(&self.pool, job).await
    }

    async fn find_by_id(&self, id: JobId) -> StoreResult<Option<Job>> {
        JobRepo::find_by_id(&self.pool, id).await
    }

    async fn list(&self, query: &JobListQuery) -> StoreResult<JobPage> {
        JobRepo::list(&self.pool, query).await
    }

    async fn mark_started(&self, id: JobId) -> StoreResult<bool> {
        JobRepo::mark_started(&self.pool, id).await
    }

    async fn claim_next(&self) -> StoreResult<Option<Job>> {
        JobRepo::claim_next(&self.pool).await
    }

    async fn update_progress(
        &self,
        id: JobId,
        seq: i64,
        percent: i16,
        step: &str,
    ) -> StoreResult<ProgressWrite> {
        JobRepo::update_progress(&self.pool, id, seq, percent, step).await
    }

    async fn complete(&self, id: JobId, outcome: &JobOutcome) -> StoreResult<bool> {
        JobRepo::complete(&self.pool, id, outcome).await
    }

    async fn fail(&self, id: JobId, error: &str) -> StoreResult<bool> {
        JobRepo::fail(&self.pool, id, error).await
    }

    async fn cancel(&self, id: JobId) -> StoreResult<bool> {
        JobRepo::cancel(&self.pool, id).await
    }
}
