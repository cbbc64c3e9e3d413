//! In-process [`JobStore`] used when no database is configured, and by tests.
//!
//! All rows live behind one `RwLock`; every mutation applies the same
//! state machine guards as the SQL repository while holding the write
//! lock, so readers only ever see committed rows.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use qsim_core::types::{JobId, Timestamp};
use tokio::sync::RwLock;

use crate::models::job::{Job, JobListQuery, JobOutcome, JobPage, NewJob, ProgressWrite, STEP_COMPLETE};
use crate::models::status::{JobStatus, ACTIVE_STATUSES};
use crate::store::{JobStore, StoreResult};

struct Row {
    /// Insertion order, breaks `created_at` ties when listing.
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct State {
    rows: HashMap<JobId, Row>,
    next_seq: u64,
}

/// Job store holding all records in memory.
#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to a job whose status is one of `allowed`.
    async fn transition<F>(&self, id: JobId, allowed: &[JobStatus], f: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let mut state = self.state.write().await;
        match state.rows.get_mut(&id) {
            Some(row) if allowed.contains(&row.job.status) => {
                f(&mut row.job);
                true
            }
            _ => false,
        }
    }
}

/// A timestamp no earlier than `floor`, keeping lifecycle stamps ordered.
fn stamp_after(floor: Option<Timestamp>) -> Timestamp {
    let now = Utc::now();
    match floor {
        Some(floor) if floor > now => floor,
        _ => now,
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, input: &NewJob) -> StoreResult<Job> {
        let mut state = self.state.write().await;
        if state.rows.contains_key(&input.id) {
            return Err(sqlx::Error::Protocol(format!(
                "duplicate job id {}",
                input.id
            )));
        }

        let job = Job {
            id: input.id,
            status: JobStatus::Pending,
            method: input.method.clone(),
            molecule_name: input.molecule_name.clone(),
            molecule_spec: input.molecule_spec.clone(),
            config: input.config.clone(),
            progress: 0,
            current_step: String::new(),
            progress_seq: 0,
            result_energy: None,
            energy_history: None,
            result_metadata: None,
            error_message: None,
            created_at: Utc::now(),
            claimed_at: None,
            started_at: None,
            completed_at: None,
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        state.rows.insert(
            job.id,
            Row {
                seq,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    async fn find_by_id(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.state.read().await.rows.get(&id).map(|r| r.job.clone()))
    }

    async fn list(&self, query: &JobListQuery) -> StoreResult<JobPage> {
        let state = self.state.read().await;
        let mut matching: Vec<&Row> = state
            .rows
            .values()
            .filter(|r| query.status.map_or(true, |s| r.job.status == s))
            .collect();
        matching.sort_by(|a, b| {
            b.job
                .created_at
                .cmp(&a.job.created_at)
                .then(b.seq.cmp(&a.seq))
        });

        let total = matching.len() as i64;
        let jobs = matching
            .into_iter()
            .skip(query.effective_offset() as usize)
            .take(query.effective_limit() as usize)
            .map(|r| r.job.clone())
            .collect();

        Ok(JobPage { jobs, total })
    }

    async fn mark_started(&self, id: JobId) -> StoreResult<bool> {
        Ok(self
            .transition(id, &[JobStatus::Pending], |job| {
                job.status = JobStatus::Running;
                job.started_at = Some(stamp_after(Some(job.created_at)));
            })
            .await)
    }

    async fn claim_next(&self) -> StoreResult<Option<Job>> {
        let mut state = self.state.write().await;
        let next = state
            .rows
            .values_mut()
            .filter(|r| r.job.status == JobStatus::Pending && r.job.claimed_at.is_none())
            .min_by_key(|r| (r.job.created_at, r.seq));

        Ok(next.map(|row| {
            row.job.claimed_at = Some(Utc::now());
            row.job.clone()
        }))
    }

    async fn update_progress(
        &self,
        id: JobId,
        seq: i64,
        percent: i16,
        step: &str,
    ) -> StoreResult<ProgressWrite> {
        let mut state = self.state.write().await;
        let Some(row) = state.rows.get_mut(&id) else {
            return Ok(ProgressWrite::Rejected);
        };
        let job = &mut row.job;
        if job.status != JobStatus::Running {
            return Ok(ProgressWrite::Rejected);
        }
        if seq <= job.progress_seq {
            return Ok(ProgressWrite::Stale);
        }
        job.progress = job.progress.max(percent);
        job.current_step = step.to_string();
        job.progress_seq = seq;
        Ok(ProgressWrite::Applied)
    }

    async fn complete(&self, id: JobId, outcome: &JobOutcome) -> StoreResult<bool> {
        Ok(self
            .transition(id, &[JobStatus::Running], |job| {
                job.status = JobStatus::Completed;
                job.completed_at = Some(stamp_after(job.started_at));
                job.progress = 100;
                job.current_step = STEP_COMPLETE.to_string();
                job.result_energy = Some(outcome.energy);
                job.energy_history = Some(outcome.energy_history.clone());
                job.result_metadata = Some(outcome.metadata.clone());
            })
            .await)
    }

    async fn fail(&self, id: JobId, error: &str) -> StoreResult<bool> {
        Ok(self
            .transition(id, &ACTIVE_STATUSES, |job| {
                job.status = JobStatus::Failed;
                job.error_message = Some(error.to_string());
                job.completed_at = Some(stamp_after(job.started_at.or(Some(job.created_at))));
            })
            .await)
    }

    async fn cancel(&self, id: JobId) -> StoreResult<bool> {
        Ok(self
            .transition(id, &ACTIVE_STATUSES, |job| {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(stamp_after(job.started_at.or(Some(job.created_at))));
            })
            .await)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
