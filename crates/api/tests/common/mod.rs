#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use quarry_api::config::{RelayConfig, ServerConfig};
use quarry_api::engine::ResearchDispatcher;
use quarry_api::relay::LiveRuns;
use quarry_api::router::build_app_router;
use quarry_api::state::AppState;
use quarry_core::jobs::RetryPolicy;
use quarry_db::memory::{MemoryJobQueue, MemoryResultStore};
use quarry_events::ProgressBus;
use quarry_worker::{GenerationWorker, JobRunner, WorkerConfig};
use quarry_workflow::scripted::ScriptedGeneration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Build a test `ServerConfig` with safe defaults.
///
/// Uses `http://localhost:5173` as CORS origin (matching the dev default)
/// and a 30-second request timeout.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        embedded_workers: 0,
    }
}

/// An application wired to memory adapters, plus handles to inspect them.
pub struct TestApp {
    pub app: Router,
    pub store: Arc<MemoryResultStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub service: Arc<ScriptedGeneration>,
}

/// Build the full application router with all middleware layers, backed by
/// memory adapters and a scripted upstream.
///
/// Uses the same router builder as `main.rs`, so integration tests exercise
/// the production middleware stack (CORS, request ID, timeout, tracing,
/// panic recovery).
pub fn build_test_app(service: ScriptedGeneration) -> TestApp {
    let config = test_config();
    let store = Arc::new(MemoryResultStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let bus = Arc::new(ProgressBus::default());
    let service = Arc::new(service);
    let worker = Arc::new(GenerationWorker::new(
        store.clone(),
        bus.clone(),
        service.clone(),
    ));

    let runner = Arc::new(JobRunner::new(queue.clone(), worker, &WorkerConfig::default()));

    let state = AppState {
        config: Arc::new(config.clone()),
        relay_config: Arc::new(RelayConfig::default()),
        store: store.clone(),
        queue: queue.clone(),
        bus,
        dispatcher: Arc::new(ResearchDispatcher::new(queue.clone(), RetryPolicy::default())),
        runner,
        live_runs: Arc::new(LiveRuns::new()),
        shutdown: CancellationToken::new(),
    };

    TestApp {
        app: build_app_router(state, &config),
        store,
        queue,
        service,
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone()
        .oneshot(request)
        .await
        .expect("router is infallible")
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

pub async fn get_as(app: &Router, uri: &str, user_id: &str) -> Response<Body> {
    let request = Request::get(uri)
        .header("x-user-id", user_id)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn post_json(
    app: &Router,
    uri: &str,
    user_id: &str,
    body: serde_json::Value,
) -> Response<Body> {
    let request = Request::post(uri)
        .header("content-type", "application/json")
        .header("x-user-id", user_id)
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).expect("response body should be JSON")
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).expect("response body should be UTF-8")
}
