use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct ApiInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub supported_methods: Vec<String>,
    pub max_atoms: usize,
}

/// GET /api/v1 -- API name, version and the methods this server accepts.
pub async fn api_info(State(state): State<AppState>) -> Json<ApiInfo> {
    Json(ApiInfo {
        name: "Quantum Simulation API",
        version: env!("CARGO_PKG_VERSION"),
        supported_methods: state.jobs.manager().solvers().methods(),
        max_atoms: qsim_core::simulation::MAX_ATOMS,
    })
}
