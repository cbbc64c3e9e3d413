pub mod health;
pub mod simulations;

use axum::routing::get;
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /                                    API info
///
/// /simulations                         list, create
/// /simulations/{id}                    get, cancel (DELETE)
/// /simulations/{id}/energy-history     energy per iteration
/// /simulations/{id}/stream             progress stream (WebSocket)
/// /simulations/debug/active            active job registry
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::info::api_info))
        .nest("/simulations", simulations::router())
}
