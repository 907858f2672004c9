use std::sync::Arc;

use quarry_db::queue::JobQueue;
use quarry_db::store::ResultStore;
use quarry_events::ProgressBus;
use quarry_worker::JobRunner;
use tokio_util::sync::CancellationToken;

use crate::config::{RelayConfig, ServerConfig};
use crate::engine::ResearchDispatcher;
use crate::relay::{LiveRuns, RelayDeps};

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Stream relay timing.
    pub relay_config: Arc<RelayConfig>,
    /// Result Store adapter.
    pub store: Arc<dyn ResultStore>,
    /// Job Queue adapter.
    pub queue: Arc<dyn JobQueue>,
    /// In-process progress bus shared with the generation worker.
    pub bus: Arc<ProgressBus>,
    /// Submits generation jobs.
    pub dispatcher: Arc<ResearchDispatcher>,
    /// Runs queue jobs claimed by live relay connections.
    pub runner: Arc<JobRunner>,
    /// Results currently generated by live relay connections.
    pub live_runs: Arc<LiveRuns>,
    /// Cancelled when the server shuts down; relay connections hold child tokens.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Handles a relay connection reads from.
    pub fn relay_deps(&self) -> RelayDeps {
        RelayDeps {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            dispatcher: Arc::clone(&self.dispatcher),
            runner: Arc::clone(&self.runner),
            live_runs: Arc::clone(&self.live_runs),
        }
    }
}
