//! Message type names for progress channel events.
//!
//! Serialized into the `type` field of every event pushed to progress
//! stream subscribers (see `qsim_events::progress::ProgressEvent`).

/// Incremental progress update during job execution.
pub const MSG_TYPE_JOB_PROGRESS: &str = "progress";

/// Job reached a terminal state (completed, failed or cancelled).
pub const MSG_TYPE_JOB_TERMINAL: &str = "terminal";
