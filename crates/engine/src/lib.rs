//! Job orchestration engine.
//!
//! - [`JobManager`]: active-job registry, admission control, dispatch and
//!   cancellation.
//! - [`worker`]: the per-job execution protocol (start, run solver, relay
//!   progress, record the outcome, deregister).
//! - [`JobService`]: the operations the API layer calls.
//! - [`TimeoutWatchdog`]: optional maximum-duration policy.
//! - [`QueueConsumer`]: claims pending jobs in a separate worker process.

pub mod config;
pub mod error;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod service;
pub mod watchdog;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{AdmissionPolicy, ConfigError, DispatchMode, EngineConfig};
pub use error::EngineError;
pub use manager::{Dispatched, JobManager, SlotReservation};
pub use queue::QueueConsumer;
pub use registry::{ActiveJobInfo, JobPhase};
pub use service::JobService;
pub use watchdog::TimeoutWatchdog;
