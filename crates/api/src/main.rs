use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quarry_api::config::{RelayConfig, ServerConfig};
use quarry_api::engine::ResearchDispatcher;
use quarry_api::relay::LiveRuns;
use quarry_api::router::build_app_router;
use quarry_api::state::AppState;
use quarry_db::queue::{JobQueue, PgJobQueue};
use quarry_db::store::{PgResultStore, ResultStore};
use quarry_events::ProgressBus;
use quarry_worker::{GenerationWorker, JobRunner, QueueConfig, WorkerConfig, WorkerPool};
use quarry_workflow::{WorkflowApi, WorkflowConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "quarry_api=debug,quarry_worker=debug,tower_http=debug".into());
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let relay_config = RelayConfig::from_env();
    let queue_config = QueueConfig::from_env();
    let worker_config = WorkerConfig::from_env();
    let workflow_config = WorkflowConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = quarry_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    quarry_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    quarry_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Store, queue and progress bus ---
    let store: Arc<dyn ResultStore> = Arc::new(PgResultStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool));
    let bus = Arc::new(ProgressBus::default());

    // --- Generation worker ---
    let service = WorkflowApi::new(&workflow_config).expect("Failed to build workflow client");
    let worker = Arc::new(
        GenerationWorker::new(Arc::clone(&store), Arc::clone(&bus), Arc::new(service))
            .with_max_generation(worker_config.max_generation)
            .with_default_user(workflow_config.default_user.clone()),
    );
    let runner = Arc::new(JobRunner::new(
        Arc::clone(&queue),
        Arc::clone(&worker),
        &worker_config,
    ));

    let shutdown = CancellationToken::new();

    // Embedded workers share the bus, so live relay connections see their
    // progress without polling.
    let pool_handle = if config.embedded_workers > 0 {
        let worker_pool = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&worker),
            WorkerConfig {
                concurrency: config.embedded_workers,
                ..worker_config
            },
        ));
        tracing::info!(workers = config.embedded_workers, "Embedded worker pool started");
        Some(worker_pool.spawn(shutdown.child_token()))
    } else {
        None
    };

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        relay_config: Arc::new(relay_config),
        store,
        queue: Arc::clone(&queue),
        bus,
        dispatcher: Arc::new(ResearchDispatcher::new(queue, queue_config.retry)),
        runner,
        live_runs: Arc::new(LiveRuns::new()),
        shutdown: shutdown.clone(),
    };

    // --- Router ---
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    // Relay streams never end on their own; cancel them once a signal
    // arrives so graceful shutdown can complete.
    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    shutdown.cancel();

    if let Some(handle) = pool_handle {
        let timeout = Duration::from_secs(config.shutdown_timeout_secs);
        if tokio::time::timeout(timeout, handle).await.is_err() {
            tracing::warn!("Embedded worker pool did not stop in time");
        }
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager (e.g. systemd, Docker, Kubernetes).
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
        _ = ctrl_c => tracing::info!("Received Ctrl-C, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
