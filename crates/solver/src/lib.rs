//! Solver Interface.
//!
//! The engine treats every numerical method as a black box behind the
//! synchronous [`Solver`] trait. Implementations report incremental
//! progress through a [`ProgressSink`] and return a [`SolverOutput`] or a
//! [`SolverError`].
//!
//! - [`SolverRegistry`] maps method names to solver instances.
//! - [`CommandSolver`] adapts an external program speaking a JSON-lines
//!   protocol on stdout.

pub mod command;
pub mod registry;
pub mod solver;

pub use command::CommandSolver;
pub use registry::SolverRegistry;
pub use solver::{ProgressSink, Solver, SolverError, SolverInput, SolverOutput, SolverProgress};
