//! Route definitions for the `/simulations` resource.

use axum::routing::get;
use axum::Router;

use crate::handlers::simulations;
use crate::state::AppState;
use crate::ws;

/// Routes mounted at `/simulations`.
///
/// ```text
/// GET    /                      -> list_simulations
/// POST   /                      -> create_simulation
/// GET    /{id}                  -> get_simulation
/// DELETE /{id}                  -> cancel_simulation
/// GET    /{id}/energy-history   -> get_energy_history
/// GET    /{id}/stream           -> progress_stream (WebSocket)
/// GET    /debug/active          -> active_simulations
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(simulations::list_simulations).post(simulations::create_simulation),
        )
        .route("/debug/active", get(simulations::active_simulations))
        .route(
            "/{id}",
            get(simulations::get_simulation).delete(simulations::cancel_simulation),
        )
        .route("/{id}/energy-history", get(simulations::get_energy_history))
        .route("/{id}/stream", get(ws::progress_stream))
}
