//! Scripted [`GenerationService`] for tests, behind the `test-util` feature.
//!
//! Replays prepared response bodies chunk by chunk, optionally pausing
//! between chunks, and records every request it receives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::api::{ByteStream, GenerationService, WorkflowError, WorkflowRunRequest};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// A success status followed by these body chunks.
    Body(Vec<Vec<u8>>),
    /// A non-success status with this body.
    Status { status: u16, body: String },
}

/// Replays [`ScriptedRun`]s in order; the last one repeats once the
/// script is exhausted.
pub struct ScriptedGeneration {
    runs: Mutex<VecDeque<ScriptedRun>>,
    last: Mutex<Option<ScriptedRun>>,
    requests: Mutex<Vec<WorkflowRunRequest>>,
    calls: AtomicUsize,
    chunk_delay: Duration,
}

impl ScriptedGeneration {
    pub fn new(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        Self {
            runs: Mutex::new(runs.into_iter().collect()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            chunk_delay: Duration::ZERO,
        }
    }

    /// Pause this long before every chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Number of runs started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub async fn requests(&self) -> Vec<WorkflowRunRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl GenerationService for ScriptedGeneration {
    async fn run(&self, request: WorkflowRunRequest) -> Result<ByteStream, WorkflowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request);

        let run = {
            let mut last = self.last.lock().await;
            match self.runs.lock().await.pop_front() {
                Some(run) => {
                    *last = Some(run.clone());
                    Some(run)
                }
                None => last.clone(),
            }
        };

        match run {
            Some(ScriptedRun::Body(chunks)) if self.chunk_delay.is_zero() => Ok(byte_stream(chunks)),
            Some(ScriptedRun::Body(chunks)) => Ok(delayed_byte_stream(chunks, self.chunk_delay)),
            Some(ScriptedRun::Status { status, body }) => Err(WorkflowError::Api { status, body }),
            None => Err(WorkflowError::Api {
                status: 503,
                body: "no scripted run".to_string(),
            }),
        }
    }
}

/// A body that yields `chunks` immediately.
pub fn byte_stream(chunks: Vec<Vec<u8>>) -> ByteStream {
    futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c)))).boxed()
}

/// A body that sleeps `delay` before each chunk.
pub fn delayed_byte_stream(chunks: Vec<Vec<u8>>, delay: Duration) -> ByteStream {
    futures::stream::iter(chunks)
        .then(move |c| async move {
            tokio::time::sleep(delay).await;
            Ok(Bytes::from(c))
        })
        .boxed()
}

/// Encode one event as an upstream frame.
pub fn frame(event: &serde_json::Value) -> String {
    format!("data: {event}\n\n")
}

/// A complete successful run: `workflow_started`, one `text_chunk` per
/// text, then `workflow_finished` with no outputs. One chunk per frame.
pub fn text_run(texts: &[&str]) -> ScriptedRun {
    let mut frames = vec![frame(&serde_json::json!({
        "event": "workflow_started",
        "data": {"id": "run-1"}
    }))];
    frames.extend(texts.iter().map(|text| {
        frame(&serde_json::json!({
            "event": "text_chunk",
            "data": {"text": text}
        }))
    }));
    frames.push(frame(&serde_json::json!({
        "event": "workflow_finished",
        "data": {"status": "succeeded"}
    })));
    ScriptedRun::Body(frames.into_iter().map(String::into_bytes).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn last_run_repeats() {
        let service = ScriptedGeneration::new([ScriptedRun::Status {
            status: 500,
            body: "boom".into(),
        }]);
        for _ in 0..2 {
            let err = service
                .run(WorkflowRunRequest::streaming("Q", "u"))
                .await
                .err();
            assert_matches!(err, Some(WorkflowError::Api { status: 500, .. }));
        }
        assert_eq!(service.calls(), 2);
        assert_eq!(service.requests().await[0].inputs.research_question, "Q");
    }
}
