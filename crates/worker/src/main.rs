//! Standalone job worker: claims queued simulation jobs from the shared
//! PostgreSQL store and runs them, for deployments with
//! `DISPATCH_MODE=queue` on the API side.

use std::sync::Arc;

use anyhow::Context;
use qsim_db::PgJobStore;
use qsim_engine::{DispatchMode, EngineConfig, JobManager, QueueConsumer, TimeoutWatchdog};
use qsim_events::ProgressHub;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "qsim_worker=debug,qsim_engine=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let mut config = EngineConfig::from_env()?;
    // This process executes what it claims; it never re-enqueues.
    config.dispatch_mode = DispatchMode::Inline;

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set for qsim-worker")?;
    let pool = qsim_db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    qsim_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let solvers = config.solver_registry();
    if solvers.is_empty() {
        anyhow::bail!("SOLVER_COMMAND must be set for qsim-worker");
    }
    tracing::info!(
        methods = ?solvers.methods(),
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Worker starting",
    );

    // Events published here reach only this process; API-side
    // subscribers observe these jobs through the store.
    let hub = Arc::new(ProgressHub::new(config.progress_channel_capacity));
    let manager = Arc::new(JobManager::new(
        Arc::new(PgJobStore::new(pool)),
        Arc::new(solvers),
        hub,
        &config,
    ));

    let cancel = CancellationToken::new();

    let consumer = QueueConsumer::new(Arc::clone(&manager), config.queue_poll_interval);
    let consumer_cancel = cancel.clone();
    let consumer_handle = tokio::spawn(async move { consumer.run(consumer_cancel).await });

    let watchdog_handle = config.job_timeout.map(|limit| {
        let watchdog = TimeoutWatchdog::new(Arc::clone(&manager), limit, config.watchdog_interval);
        let watchdog_cancel = cancel.clone();
        tokio::spawn(async move { watchdog.run(watchdog_cancel).await })
    });

    shutdown_signal().await;
    tracing::info!("Shutdown requested, stopping queue consumer");

    cancel.cancel();
    let _ = consumer_handle.await;
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }

    let interrupted = manager.shutdown().await;
    tracing::info!(interrupted, "Worker stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
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
        () = ctrl_c => tracing::info!("Received SIGINT"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
