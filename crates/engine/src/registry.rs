//! Active-job registry shared by the API path, workers and the watchdog.
//!
//! Every mutation happens under one mutex. A worker holds a
//! [`Registration`] for its whole lifetime; dropping it (including during
//! a panic unwind) removes the entry, but only if the entry still belongs
//! to that registration.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use qsim_core::types::{JobId, Timestamp};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const PHASE_QUEUED: u8 = 0;
const PHASE_RUNNING: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    /// Registered, waiting for an admission slot.
    Queued,
    /// The record has been moved to `Running`.
    Running,
}

/// Liveness data shared between a registry entry and its worker.
#[derive(Debug)]
struct Liveness {
    phase: AtomicU8,
    registered_at: Timestamp,
    started: OnceLock<(Timestamp, Instant)>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(PHASE_QUEUED),
            registered_at: Utc::now(),
            started: OnceLock::new(),
        }
    }

    fn phase(&self) -> JobPhase {
        match self.phase.load(Ordering::Acquire) {
            PHASE_RUNNING => JobPhase::Running,
            _ => JobPhase::Queued,
        }
    }
}

#[derive(Debug)]
struct ActiveJob {
    ticket: u64,
    token: CancellationToken,
    liveness: Arc<Liveness>,
    worker: String,
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJobInfo {
    pub worker: String,
    pub phase: JobPhase,
    pub registered_at: Timestamp,
    pub started_at: Option<Timestamp>,
    /// Whether the worker task still holds its registration.
    pub is_alive: bool,
}

/// Returned by [`JobRegistry::try_register`] when the id is already active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyActive;

#[derive(Debug, Default)]
pub struct JobRegistry {
    entries: Mutex<HashMap<JobId, ActiveJob>>,
    next_ticket: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, ActiveJob>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `job_id` as active. Fails if it already is.
    pub fn try_register(self: &Arc<Self>, job_id: JobId) -> Result<Registration, AlreadyActive> {
        let mut entries = self.lock();
        if entries.contains_key(&job_id) {
            return Err(AlreadyActive);
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let liveness = Arc::new(Liveness::new());
        let simple = job_id.simple().to_string();
        let worker = format!("job-{}", &simple[..8]);

        entries.insert(
            job_id,
            ActiveJob {
                ticket,
                token: token.clone(),
                liveness: Arc::clone(&liveness),
                worker: worker.clone(),
            },
        );

        Ok(Registration {
            registry: Arc::clone(self),
            job_id,
            ticket,
            token,
            liveness,
            worker,
        })
    }

    /// Remove `job_id` and signal its cancellation token.
    ///
    /// Returns `false` if the job was not registered.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let removed = self.lock().remove(&job_id);
        match removed {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove and signal every entry. Returns the removed ids.
    pub fn cancel_all(&self) -> Vec<JobId> {
        let drained: Vec<(JobId, ActiveJob)> = self.lock().drain().collect();
        drained
            .into_iter()
            .map(|(job_id, entry)| {
                entry.token.cancel();
                job_id
            })
            .collect()
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.lock().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> BTreeMap<JobId, ActiveJobInfo> {
        self.lock()
            .iter()
            .map(|(job_id, entry)| {
                let info = ActiveJobInfo {
                    worker: entry.worker.clone(),
                    phase: entry.liveness.phase(),
                    registered_at: entry.liveness.registered_at,
                    started_at: entry.liveness.started.get().map(|(at, _)| *at),
                    // The registry holds one reference, the live worker the other.
                    is_alive: Arc::strong_count(&entry.liveness) > 1,
                };
                (*job_id, info)
            })
            .collect()
    }

    /// Running jobs that started more than `limit` ago.
    pub fn overdue(&self, limit: Duration) -> Vec<JobId> {
        self.lock()
            .iter()
            .filter(|(_, entry)| {
                entry
                    .liveness
                    .started
                    .get()
                    .is_some_and(|(_, started)| started.elapsed() > limit)
            })
            .map(|(job_id, _)| *job_id)
            .collect()
    }

    fn release(&self, job_id: JobId, ticket: u64) {
        let mut entries = self.lock();
        if entries.get(&job_id).is_some_and(|entry| entry.ticket == ticket) {
            entries.remove(&job_id);
        }
    }
}

/// A worker's claim on a registry entry, released on drop.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<JobRegistry>,
    job_id: JobId,
    ticket: u64,
    token: CancellationToken,
    liveness: Arc<Liveness>,
    worker: String,
}

impl Registration {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Record that the job's record has moved to `Running`.
    pub fn mark_running(&self) {
        let _ = self.liveness.started.set((Utc::now(), Instant::now()));
        self.liveness.phase.store(PHASE_RUNNING, Ordering::Release);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(self.job_id, self.ticket);
    }
}
