/// Simulation jobs are keyed by random UUIDs assigned at submission.
pub type JobId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Allocate a fresh job identifier.
pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4()
}
