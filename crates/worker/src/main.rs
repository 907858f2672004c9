use std::sync::Arc;
use std::time::Duration;

use quarry_db::queue::PgJobQueue;
use quarry_db::store::PgResultStore;
use quarry_events::ProgressBus;
use quarry_worker::{GenerationWorker, WorkerConfig, WorkerPool};
use quarry_workflow::{WorkflowApi, WorkflowConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "quarry_worker=debug".into());
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = WorkerConfig::from_env();
    let workflow_config = WorkflowConfig::from_env();
    tracing::info!(
        concurrency = config.concurrency,
        upstream = %workflow_config.base_url,
        "Loaded worker configuration",
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = quarry_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    quarry_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    quarry_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database ready");

    // --- Worker pool ---
    let service = WorkflowApi::new(&workflow_config).expect("Failed to build workflow client");
    let worker = GenerationWorker::new(
        Arc::new(PgResultStore::new(pool.clone())),
        Arc::new(ProgressBus::default()),
        Arc::new(service),
    )
    .with_max_generation(config.max_generation)
    .with_default_user(workflow_config.default_user.clone());

    let worker_pool = Arc::new(WorkerPool::new(
        Arc::new(PgJobQueue::new(pool)),
        Arc::new(worker),
        config,
    ));

    let cancel = CancellationToken::new();
    let handle = Arc::clone(&worker_pool).spawn(cancel.clone());

    shutdown_signal().await;
    cancel.cancel();

    // In-flight jobs are given a bounded window to finish; anything left
    // is recovered by the stalled-job sweep of another worker.
    if tokio::time::timeout(Duration::from_secs(30), handle).await.is_err() {
        tracing::warn!("Worker pool did not stop in time");
    }
    tracing::info!("Worker shut down");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
