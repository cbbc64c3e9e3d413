use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use qsim_api::config::ServerConfig;
use qsim_api::router::build_app_router;
use qsim_api::state::AppState;
use qsim_db::{JobStore, MemoryJobStore, PgJobStore};
use qsim_engine::{DispatchMode, EngineConfig, JobManager, JobService, TimeoutWatchdog};
use qsim_events::ProgressHub;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    init_tracing();

    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    let engine_config = EngineConfig::from_env()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        max_concurrent_jobs = engine_config.max_concurrent_jobs,
        admission_policy = ?engine_config.admission_policy,
        dispatch_mode = ?engine_config.dispatch_mode,
        "Loaded configuration",
    );

    // --- Job store ---
    let (store, pool): (Arc<dyn JobStore>, Option<qsim_db::DbPool>) =
        match std::env::var("DATABASE_URL").ok() {
            Some(database_url) => {
                let pool = qsim_db::create_pool(&database_url)
                    .await
                    .context("Failed to connect to database")?;
                qsim_db::health_check(&pool)
                    .await
                    .context("Database health check failed")?;
                qsim_db::run_migrations(&pool)
                    .await
                    .context("Failed to run database migrations")?;
                tracing::info!("Database ready, migrations applied");
                (Arc::new(PgJobStore::new(pool.clone())), Some(pool))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, job records are kept in memory");
                (Arc::new(MemoryJobStore::new()), None)
            }
        };

    if engine_config.dispatch_mode == DispatchMode::Queue && pool.is_none() {
        anyhow::bail!("DISPATCH_MODE=queue requires DATABASE_URL to be shared with qsim-worker");
    }

    // --- Solvers ---
    let solvers = engine_config.solver_registry();
    if solvers.is_empty() {
        tracing::warn!("SOLVER_COMMAND not set, every submission will be rejected");
    } else {
        tracing::info!(methods = ?solvers.methods(), "Solver registry built");
    }

    // --- Job engine ---
    let hub = Arc::new(ProgressHub::new(engine_config.progress_channel_capacity));
    let manager = Arc::new(JobManager::new(
        store,
        Arc::new(solvers),
        hub,
        &engine_config,
    ));
    let jobs = JobService::new(Arc::clone(&manager));

    // --- Timeout watchdog ---
    let background_cancel = CancellationToken::new();
    let watchdog_handle = engine_config.job_timeout.map(|limit| {
        let watchdog = TimeoutWatchdog::new(
            Arc::clone(&manager),
            limit,
            engine_config.watchdog_interval,
        );
        let cancel = background_cancel.clone();
        tokio::spawn(async move { watchdog.run(cancel).await })
    });

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        jobs,
        pool,
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let host = config
        .host
        .parse()
        .with_context(|| format!("Invalid HOST address '{}'", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    background_cancel.cancel();
    if let Some(handle) = watchdog_handle {
        let _ = tokio::time::timeout(Duration::from_secs(config.shutdown_timeout_secs), handle).await;
        tracing::info!("Timeout watchdog stopped");
    }

    let interrupted = manager.shutdown().await;
    tracing::info!(interrupted, "Graceful shutdown complete");
    Ok(())
}

/// Install the global tracing subscriber. `LOG_FORMAT=json` switches to
/// JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "qsim_api=debug,qsim_engine=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for SIGINT or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
