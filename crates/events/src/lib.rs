//! Per-job progress channel.
//!
//! - [`ProgressEvent`]: the tagged union pushed to observers.
//! - [`ProgressHub`]: registry of per-job `tokio::sync::broadcast`
//!   channels; publishing never blocks the caller.
//! - [`ProgressSubscription`]: one observer's view of a job's stream,
//!   ending after the terminal event.
//!
//! The channel keeps no history. The job record is the durable copy of
//! the same information.

pub mod progress;

pub use progress::{ProgressEvent, ProgressHub, ProgressSubscription};
