use std::sync::Arc;

use qsim_engine::JobService;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Job engine facade (submission, queries, cancellation, progress).
    pub jobs: JobService,
    /// Database pool, when the PostgreSQL store is in use.
    pub pool: Option<qsim_db::DbPool>,
}
