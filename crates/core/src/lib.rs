//! Shared building blocks for the simulation job platform.
//!
//! Holds the id/timestamp aliases, the domain error taxonomy, the
//! submission request shape with its validation rules, and the message
//! type names used on the progress channel. No I/O lives here.

pub mod error;
pub mod job_events;
pub mod simulation;
pub mod types;
