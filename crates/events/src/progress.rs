use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use qsim_core::types::JobId;
use qsim_db::models::job::Job;
use qsim_db::models::status::JobStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// An update about one job, delivered to that job's subscribers.
///
/// Serialized with a `type` tag matching the constants in
/// [`qsim_core::job_events`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Incremental, non-authoritative progress from a running solver.
    Progress {
        job_id: JobId,
        progress: i16,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        energy: Option<f64>,
    },
    /// The job reached a terminal state. Always the last event of a stream.
    Terminal {
        job_id: JobId,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ProgressEvent {
    pub fn progress(job_id: JobId, progress: i16, message: impl Into<String>, energy: Option<f64>) -> Self {
        Self::Progress {
            job_id,
            progress,
            message: message.into(),
            energy,
        }
    }

    pub fn terminal(job_id: JobId, status: JobStatus, error: Option<String>) -> Self {
        Self::Terminal {
            job_id,
            status,
            error,
        }
    }

    /// Terminal event describing a finished job record, `None` while the
    /// job is still active.
    pub fn terminal_for(job: &Job) -> Option<Self> {
        job.is_terminal()
            .then(|| Self::terminal(job.id, job.status, job.error_message.clone()))
    }

    pub fn job_id(&self) -> JobId {
        match self {
            Self::Progress { job_id, .. } | Self::Terminal { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}

// ---------------------------------------------------------------------------
// ProgressHub
// ---------------------------------------------------------------------------

/// Default buffer capacity of each per-job channel.
pub const DEFAULT_CAPACITY: usize = 256;

/// Fan-out hub keyed by job id.
///
/// Channels are created lazily by the first subscriber and dropped once
/// the job's terminal event has been published, or when a publish finds
/// nobody listening. Designed to be shared via `Arc<ProgressHub>`.
pub struct ProgressHub {
    channels: RwLock<HashMap<JobId, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl ProgressHub {
    /// Create a hub whose per-job channels buffer `capacity` events.
    ///
    /// A subscriber that falls more than `capacity` events behind loses
    /// the oldest ones.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Deliver `event` to every current subscriber of its job.
    ///
    /// Never blocks and never fails: with no subscribers the event is
    /// dropped.
    pub fn publish(&self, event: ProgressEvent) {
        let job_id = event.job_id();
        let terminal = event.is_terminal();

        let delivered = {
            let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
            match channels.get(&job_id) {
                Some(tx) => tx.send(event).is_ok(),
                None => return,
            }
        };

        if terminal || !delivered {
            let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
            // A subscriber may have attached since the read lock was released.
            let idle = channels
                .get(&job_id)
                .is_some_and(|tx| tx.receiver_count() == 0);
            if terminal || idle {
                channels.remove(&job_id);
            }
        }
    }

    /// Attach a new subscriber to `job_id`'s stream.
    ///
    /// Only events published after this call are delivered.
    pub fn subscribe(&self, job_id: JobId) -> ProgressSubscription {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let rx = channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        ProgressSubscription {
            job_id,
            receiver: Some(rx),
            replay: None,
            finished: false,
        }
    }

    /// Drop `job_id`'s channel if nobody is subscribed to it.
    pub fn prune_idle(&self, job_id: JobId) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels
            .get(&job_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(&job_id);
        }
    }

    /// Number of live subscribers for a job.
    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Number of jobs with an open channel.
    pub fn channel_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// ProgressSubscription
// ---------------------------------------------------------------------------

/// A single observer of one job's progress stream.
#[derive(Debug)]
pub struct ProgressSubscription {
    job_id: JobId,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
    /// Event to yield before anything from the channel.
    replay: Option<ProgressEvent>,
    finished: bool,
}

impl ProgressSubscription {
    /// A subscription for a job that has already finished: yields the
    /// given terminal event and then ends.
    pub fn finished(event: ProgressEvent) -> Self {
        Self {
            job_id: event.job_id(),
            receiver: None,
            replay: Some(event),
            finished: false,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the terminal event has been delivered or the
    /// channel has closed. Events missed because this subscriber lagged
    /// are skipped.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.replay.take() {
            self.finished = event.is_terminal();
            return Some(event);
        }

        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    self.finished = event.is_terminal();
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        skipped,
                        "Progress subscriber lagged, some events were dropped",
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
