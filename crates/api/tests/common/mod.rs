#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use qsim_api::config::ServerConfig;
use qsim_api::router::build_app_router;
use qsim_api::state::AppState;
use qsim_db::MemoryJobStore;
use qsim_engine::{EngineConfig, JobManager, JobService};
use qsim_events::ProgressHub;
use qsim_solver::{ProgressSink, Solver, SolverError, SolverInput, SolverOutput, SolverRegistry};
use serde_json::{json, Value};
use tower::ServiceExt;

pub const STUB_ENERGY: f64 = -1.137;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:3000".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
    }
}

// ---------------------------------------------------------------------------
// Stub solvers
// ---------------------------------------------------------------------------

/// Ten iterations converging on [`STUB_ENERGY`].
pub struct StubSolver;

impl Solver for StubSolver {
    fn run(&self, _input: &SolverInput, sink: &ProgressSink) -> Result<SolverOutput, SolverError> {
        let mut history = Vec::new();
        for i in 1..=10 {
            let energy = if i == 10 { STUB_ENERGY } else { STUB_ENERGY + 0.1 / i as f64 };
            history.push(energy);
            sink.report(i * 10, format!("Iteration {i}"), Some(energy));
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(SolverOutput {
            energy: STUB_ENERGY,
            energy_history: history,
            converged: true,
            num_iterations: 10,
            metadata: json!({ "stub": true }),
        })
    }
}

pub struct FailingSolver;

impl Solver for FailingSolver {
    fn run(&self, _input: &SolverInput, _sink: &ProgressSink) -> Result<SolverOutput, SolverError> {
        Err(SolverError::Failed("SCF did not converge".to_string()))
    }
}

/// Reports progress until released or cancelled.
pub struct GatedSolver {
    pub release: Arc<AtomicBool>,
}

impl Solver for GatedSolver {
    fn run(&self, _input: &SolverInput, sink: &ProgressSink) -> Result<SolverOutput, SolverError> {
        while !self.release.load(Ordering::Acquire) {
            if sink.is_cancelled() {
                return Err(SolverError::Cancelled);
            }
            sink.report(5, "Waiting", None);
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(SolverOutput {
            energy: -2.0,
            energy_history: vec![-2.0],
            converged: true,
            num_iterations: 1,
            metadata: json!({}),
        })
    }
}

// ---------------------------------------------------------------------------
// App construction
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryJobStore>,
    pub jobs: JobService,
    pub release: Arc<AtomicBool>,
}

impl TestApp {
    /// A fresh clone of the router for a single `oneshot` request.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

/// Registry with methods `stub`, `fail` and `gated`.
pub fn stub_solvers(release: &Arc<AtomicBool>) -> SolverRegistry {
    SolverRegistry::new()
        .with("stub", Arc::new(StubSolver))
        .with("fail", Arc::new(FailingSolver))
        .with(
            "gated",
            Arc::new(GatedSolver {
                release: Arc::clone(release),
            }),
        )
}

/// Build the full application router backed by the in-memory store and
/// stub solvers `stub`, `fail` and `gated`.
pub fn build_test_app() -> TestApp {
    build_test_app_with(EngineConfig::default())
}

pub fn build_test_app_with(engine_config: EngineConfig) -> TestApp {
    let config = test_config();
    let release = Arc::new(AtomicBool::new(false));

    let store = Arc::new(MemoryJobStore::new());
    let manager = Arc::new(JobManager::new(
        store.clone(),
        Arc::new(stub_solvers(&release)),
        Arc::new(ProgressHub::new(engine_config.progress_channel_capacity)),
        &engine_config,
    ));
    let jobs = JobService::new(manager);

    let state = AppState {
        config: Arc::new(config.clone()),
        jobs: jobs.clone(),
        pool: None,
    };

    TestApp {
        router: build_app_router(state, &config),
        store,
        jobs,
        release,
    }
}

/// Serve the app on an ephemeral local port, returning its address.
pub async fn spawn_server(app: &TestApp) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let router = app.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    addr
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub fn h2_request(method: &str) -> Value {
    json!({
        "method": method,
        "molecule": {
            "name": "H2",
            "atoms": [
                { "symbol": "H", "position": [0.0, 0.0, 0.0] },
                { "symbol": "H", "position": [0.0, 0.0, 0.74] }
            ]
        },
        "config": { "steps": 10 }
    })
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, Body::empty()).await
}

pub async fn delete(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::DELETE, uri, Body::empty()).await
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    app.oneshot(request).await.expect("response")
}

pub async fn post_raw(app: Router, uri: &str, body: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    app.oneshot(request).await.expect("response")
}

async fn send(app: Router, method: Method, uri: &str, body: Body) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .expect("request");
    app.oneshot(request).await.expect("response")
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("JSON body")
}

/// Submit a job and return its id.
pub async fn create_job(app: &TestApp, method: &str) -> String {
    let response = post_json(app.router(), "/api/v1/simulations", h2_request(method)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    json["job_id"].as_str().expect("job_id").to_string()
}

/// Poll `GET /simulations/{id}` until `predicate` holds, panicking after
/// five seconds.
pub async fn wait_for(app: &TestApp, job_id: &str, predicate: impl Fn(&Value) -> bool) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let json = body_json(get(app.router(), &format!("/api/v1/simulations/{job_id}")).await).await;
        if predicate(&json) {
            return json;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {job_id}: {json}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_status(app: &TestApp, job_id: &str, status: &str) -> Value {
    wait_for(app, job_id, |job| job["status"] == status).await
}
