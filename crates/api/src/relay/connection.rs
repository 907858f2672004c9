//! One relay connection: a state machine driven by a single `select!` loop.
//!
//! The loop owns the heartbeat timer, the log poll timer, the stall
//! deadline, the upstream reader (bus subscription) and, in live mode, the
//! generation run it started. Leaving the loop goes through
//! [`RelayConnection::dispose`], which cancels the connection token, stops
//! an unfinished run and closes the sink, so nothing can write after
//! disconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quarry_core::progress::{ProgressUpdate, SequencedUpdate};
use quarry_core::types::EntityId;
use quarry_db::models::research::ResearchResult;
use quarry_db::store::ResultStore;
use quarry_events::{ProgressBus, ProgressEvent, ResultSubscription, SubscriptionError};
use quarry_worker::{JobOutcome, JobRunner};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::engine::ResearchDispatcher;
use crate::relay::frame::{coalesce, RelayFrame};
use crate::relay::live::{start_live_run, LiveContext, LiveRun, LiveRuns};

// ---------------------------------------------------------------------------
// Modes and states
// ---------------------------------------------------------------------------

/// How a connection learns about new progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Subscribe to the progress bus and, when no other worker holds the
    /// result's job, run it.
    Live,
    /// Read the progress log on a fixed period.
    #[default]
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Connected,
    Streaming,
    Complete,
    Error,
    Aborted,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }
}

// ---------------------------------------------------------------------------
// FrameSink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The client went away or the sink was closed.
    #[error("Relay sink closed")]
    Closed,

    /// A write did not complete within the loss timeout.
    #[error("Relay client stopped reading")]
    Lost,
}

/// Write side of a connection. Every successful write pushes the loss
/// deadline forward; a closed sink refuses all writes.
pub struct FrameSink {
    tx: Option<mpsc::Sender<RelayFrame>>,
    writes: Arc<AtomicU64>,
    last_write: Instant,
    loss_timeout: Duration,
}

impl FrameSink {
    /// A sink and the receiver feeding the response body.
    pub fn channel(capacity: usize, loss_timeout: Duration) -> (Self, mpsc::Receiver<RelayFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx: Some(tx),
            writes: Arc::new(AtomicU64::new(0)),
            last_write: Instant::now(),
            loss_timeout,
        };
        (sink, rx)
    }

    /// Shared count of successful writes.
    pub fn write_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.writes)
    }

    pub async fn send(&mut self, frame: RelayFrame) -> Result<(), SinkError> {
        let Some(tx) = &self.tx else {
            return Err(SinkError::Closed);
        };
        let deadline = self.last_write + self.loss_timeout;
        match tokio::time::timeout_at(deadline, tx.send(frame)).await {
            Ok(Ok(())) => {
                self.last_write = Instant::now();
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) => Err(SinkError::Closed),
            Err(_) => Err(SinkError::Lost),
        }
    }

    /// Resolves once the client side is gone.
    pub async fn disconnected(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }

    pub fn close(&mut self) {
        self.tx = None;
    }
}

// ---------------------------------------------------------------------------
// RelayConnection
// ---------------------------------------------------------------------------

/// What a client asked to follow.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub research_id: EntityId,
    pub result_id: EntityId,
    pub mode: RelayMode,
    /// Resume after this log sequence instead of sending a snapshot.
    pub last_event_id: Option<i64>,
}

/// Shared handles a connection reads from.
#[derive(Clone)]
pub struct RelayDeps {
    pub store: Arc<dyn ResultStore>,
    pub bus: Arc<ProgressBus>,
    pub dispatcher: Arc<ResearchDispatcher>,
    pub runner: Arc<JobRunner>,
    pub live_runs: Arc<LiveRuns>,
}

enum Flow {
    Continue,
    Stop(RelayState),
}

enum Wake {
    Stop,
    Heartbeat,
    Poll,
    Event(Result<ProgressEvent, SubscriptionError>),
    RunEnded(JobOutcome),
    Stalled,
}

pub struct RelayConnection {
    request: RelayRequest,
    deps: RelayDeps,
    config: RelayConfig,
    sink: FrameSink,
    cancel: CancellationToken,
    state: RelayState,
    last_seq: i64,
    /// The generation this connection started, until it ends.
    live: Option<LiveRun>,
    stall_deadline: Instant,
}

impl RelayConnection {
    pub fn new(
        request: RelayRequest,
        deps: RelayDeps,
        config: RelayConfig,
        sink: FrameSink,
        cancel: CancellationToken,
    ) -> Self {
        let stall_deadline = Instant::now() + config.stall_timeout;
        Self {
            request,
            deps,
            config,
            sink,
            cancel,
            state: RelayState::Connecting,
            last_seq: 0,
            live: None,
            stall_deadline,
        }
    }

    /// Drive the connection to a terminal state.
    pub async fn run(mut self) -> RelayState {
        let state = self.drive().await;
        self.dispose(state)
    }

    async fn drive(&mut self) -> RelayState {
        let result_id = self.request.result_id;

        if self.sink.send(RelayFrame::connected(result_id)).await.is_err() {
            return RelayState::Aborted;
        }
        self.state = RelayState::Connected;

        // Subscribe before reading the row so no update falls in between.
        let mut subscription = match self.request.mode {
            RelayMode::Live => Some(self.deps.bus.subscribe_result(result_id)),
            RelayMode::Poll => None,
        };

        let result = match self.deps.store.get(result_id).await {
            Ok(result) => result,
            Err(e) => return self.fail(format!("Failed to load result: {e}")).await,
        };

        if let Flow::Stop(state) = self.open(&result).await {
            return state;
        }

        if subscription.is_some() {
            let ctx = LiveContext {
                store: &self.deps.store,
                dispatcher: &self.deps.dispatcher,
                runner: &self.deps.runner,
                runs: &self.deps.live_runs,
            };
            match start_live_run(ctx, &result).await {
                Ok(Ok(run)) => self.live = Some(run),
                Ok(Err(reason)) => {
                    tracing::debug!(
                        result_id = %result_id,
                        reason = ?reason,
                        "Live run not started, relaying by polling",
                    );
                    subscription = None;
                }
                Err(e) => return self.fail(format!("Failed to start generation: {e}")).await,
            }
        }

        self.state = RelayState::Streaming;
        self.stall_deadline = Instant::now() + self.config.stall_timeout;

        let start = Instant::now();
        let mut heartbeat = interval_at(
            start + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = interval_at(start + self.config.poll_interval, self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Stop,
                _ = self.sink.disconnected() => Wake::Stop,
                _ = heartbeat.tick() => Wake::Heartbeat,
                _ = poll.tick(), if subscription.is_none() => Wake::Poll,
                event = next_event(&mut subscription) => Wake::Event(event),
                outcome = run_ended(&mut self.live) => Wake::RunEnded(outcome),
                _ = sleep_until(self.stall_deadline) => Wake::Stalled,
            };

            let flow = match wake {
                Wake::Stop => Flow::Stop(RelayState::Aborted),
                Wake::Heartbeat => match self.sink.send(RelayFrame::heartbeat()).await {
                    Ok(()) => Flow::Continue,
                    Err(_) => Flow::Stop(RelayState::Aborted),
                },
                Wake::Poll => self.catch_up().await,
                Wake::Event(Ok(event)) => self.on_event(event).await,
                Wake::Event(Err(SubscriptionError::Lagged { .. })) => self.catch_up().await,
                Wake::Event(Err(SubscriptionError::Closed)) => {
                    subscription = None;
                    Flow::Continue
                }
                Wake::RunEnded(outcome) => {
                    self.live = None;
                    // Flush whatever the run logged before it ended.
                    match self.catch_up().await {
                        Flow::Stop(state) => Flow::Stop(state),
                        Flow::Continue if outcome == JobOutcome::Failed => {
                            let message = "Generation failed, all attempts exhausted".to_string();
                            return self.fail(message).await;
                        }
                        Flow::Continue => {
                            // The job is back with the queue; follow it by polling.
                            subscription = None;
                            Flow::Continue
                        }
                    }
                }
                Wake::Stalled => {
                    let minutes = self.config.stall_timeout.as_secs() / 60;
                    let message = format!("No progress for {minutes} minutes, giving up");
                    return self.fail(message).await;
                }
            };

            if let Flow::Stop(state) = flow {
                return state;
            }
        }
    }

    /// Send the opening frames: a status frame, then either a snapshot of
    /// the row or the log entries after `Last-Event-ID`.
    async fn open(&mut self, result: &ResearchResult) -> Flow {
        let status = RelayFrame::status(&result.status, Some(result.progress));
        if self.sink.send(status).await.is_err() {
            return Flow::Stop(RelayState::Aborted);
        }

        match self.request.last_event_id {
            Some(after) => {
                self.last_seq = after;
                if let Flow::Stop(state) = self.catch_up().await {
                    return Flow::Stop(state);
                }
            }
            None => {
                for frame in snapshot(result) {
                    if self.sink.send(frame).await.is_err() {
                        return Flow::Stop(RelayState::Aborted);
                    }
                }
                self.last_seq = result.last_event_seq;
            }
        }

        if result.is_complete {
            return self.emit_complete().await;
        }
        Flow::Continue
    }

    async fn on_event(&mut self, event: ProgressEvent) -> Flow {
        if event.seq <= self.last_seq {
            return Flow::Continue;
        }
        if event.seq != self.last_seq + 1 {
            // Missed something on the bus; the log has it.
            return self.catch_up().await;
        }
        let entry = SequencedUpdate {
            seq: event.seq,
            update: event.update,
            created_at: event.timestamp,
        };
        self.forward(vec![entry]).await
    }

    /// Forward every log entry after the last one sent.
    async fn catch_up(&mut self) -> Flow {
        loop {
            let batch = match self
                .deps
                .store
                .events_since(self.request.result_id, self.last_seq, self.config.batch_limit)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    return Flow::Stop(self.fail(format!("Failed to read progress: {e}")).await)
                }
            };
            if batch.is_empty() {
                return Flow::Continue;
            }
            let full = batch.len() as i64 >= self.config.batch_limit;
            if let Flow::Stop(state) = self.forward(batch).await {
                return Flow::Stop(state);
            }
            if !full {
                return Flow::Continue;
            }
        }
    }

    async fn forward(&mut self, entries: Vec<SequencedUpdate>) -> Flow {
        let result_id = self.request.result_id;
        for entry in coalesce(entries) {
            self.last_seq = self.last_seq.max(entry.seq);
            match entry.update {
                ProgressUpdate::Completed => {
                    let frame = RelayFrame::complete(result_id).with_id(entry.seq);
                    return match self.sink.send(frame).await {
                        Ok(()) => Flow::Stop(RelayState::Complete),
                        Err(_) => Flow::Stop(RelayState::Aborted),
                    };
                }
                update => {
                    let frame = RelayFrame::from_update(result_id, &update).with_id(entry.seq);
                    if self.sink.send(frame).await.is_err() {
                        return Flow::Stop(RelayState::Aborted);
                    }
                    self.stall_deadline = Instant::now() + self.config.stall_timeout;
                }
            }
        }
        Flow::Continue
    }

    async fn emit_complete(&mut self) -> Flow {
        match self.sink.send(RelayFrame::complete(self.request.result_id)).await {
            Ok(()) => Flow::Stop(RelayState::Complete),
            Err(_) => Flow::Stop(RelayState::Aborted),
        }
    }

    /// Best-effort `error` frame, then the error state.
    async fn fail(&mut self, message: String) -> RelayState {
        tracing::warn!(
            result_id = %self.request.result_id,
            error = %message,
            "Relay failed",
        );
        match self.sink.send(RelayFrame::error(message)).await {
            Ok(()) => RelayState::Error,
            Err(_) => RelayState::Aborted,
        }
    }

    /// The single exit point: stop everything tied to this connection.
    fn dispose(mut self, state: RelayState) -> RelayState {
        self.cancel.cancel();
        if let Some(run) = self.live.take() {
            if state != RelayState::Complete {
                run.stop();
            }
        }
        self.sink.close();
        self.state = state;
        tracing::info!(
            research_id = %self.request.research_id,
            result_id = %self.request.result_id,
            state = self.state.as_str(),
            writes = self.sink.writes.load(Ordering::Relaxed),
            last_seq = self.last_seq,
            "Relay connection closed",
        );
        state
    }
}

async fn next_event(
    subscription: &mut Option<ResultSubscription>,
) -> Result<ProgressEvent, SubscriptionError> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn run_ended(live: &mut Option<LiveRun>) -> JobOutcome {
    match live {
        Some(run) => run.finished().await,
        None => std::future::pending().await,
    }
}

/// Frames describing everything a result already holds.
fn snapshot(result: &ResearchResult) -> Vec<RelayFrame> {
    let mut frames = Vec::new();
    if !result.markdown_content.is_empty() {
        frames.push(RelayFrame::content(&result.markdown_content, true));
    }
    if !result.sources.is_empty() {
        frames.push(RelayFrame::sources(&result.sources));
    }
    if !result.related.is_empty() {
        frames.push(RelayFrame::related(&result.related));
    }
    if let Some(data) = &result.data {
        frames.push(RelayFrame::data(data));
    }
    frames
}
