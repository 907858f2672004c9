//! Generation worker: drives one upstream workflow run for a job.
//!
//! The worker opens a streamed run, decodes its events in order and turns
//! each one into a partial write on the job's result. Every write carries
//! the [`ProgressUpdate`]s describing it; once the store has assigned their
//! log sequence numbers they are published on the [`ProgressBus`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quarry_core::jobs::ResearchJob;
use quarry_core::progress::{
    content_update, streaming_progress, ProgressUpdate, PROGRESS_COMPLETE,
    PROGRESS_WORKFLOW_STARTED,
};
use quarry_core::research::{
    merge_progress, Task, TaskOutcome, TaskStatus, STATUS_COMPLETED, STATUS_FAILED,
    STATUS_STARTED,
};
use quarry_core::types::EntityId;
use quarry_db::models::research::{ResearchResult, ResultPatch};
use quarry_db::store::{ResultStore, StoreError};
use quarry_events::{ProgressBus, ProgressEvent};
use quarry_workflow::messages::{
    NodeFinishedData, NodeStartedData, TextChunkData, WorkflowFinishedData, WorkflowStartedData,
};
use quarry_workflow::{
    GenerationService, WorkflowError, WorkflowEvent, WorkflowRunRequest, WorkflowStream,
};
use serde_json::{Map, Value};

use crate::outputs;

/// Status label written while text is streaming.
pub const STATUS_GENERATING: &str = "generating";

/// Default ceiling on one generation attempt.
pub const DEFAULT_MAX_GENERATION: Duration = Duration::from_secs(1800);

/// `user` sent upstream when a job carries no user id.
const DEFAULT_UPSTREAM_USER: &str = "research-worker";

/// Why a generation attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("Result store error: {0}")]
    Store(#[from] StoreError),

    #[error("Generation exceeded {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// What a successful attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSummary {
    pub result_id: EntityId,
    pub chunks: u32,
    pub content_length: usize,
    pub sources: usize,
}

impl GenerationSummary {
    /// Return value recorded on the completed queue job.
    pub fn return_value(&self) -> Value {
        serde_json::json!({
            "status": "success",
            "resultId": self.result_id,
        })
    }
}

/// Consumes upstream workflow runs on behalf of research jobs.
pub struct GenerationWorker {
    store: Arc<dyn ResultStore>,
    bus: Arc<ProgressBus>,
    service: Arc<dyn GenerationService>,
    max_generation: Duration,
    default_user: String,
}

impl GenerationWorker {
    pub fn new(
        store: Arc<dyn ResultStore>,
        bus: Arc<ProgressBus>,
        service: Arc<dyn GenerationService>,
    ) -> Self {
        Self {
            store,
            bus,
            service,
            max_generation: DEFAULT_MAX_GENERATION,
            default_user: DEFAULT_UPSTREAM_USER.to_string(),
        }
    }

    pub fn with_max_generation(mut self, max_generation: Duration) -> Self {
        self.max_generation = max_generation;
        self
    }

    pub fn with_default_user(mut self, user: impl Into<String>) -> Self {
        self.default_user = user.into();
        self
    }

    /// Generate the result of `job` from scratch.
    ///
    /// On failure a fallback content block is persisted (the result stays
    /// incomplete) and the error is returned so the queue can retry.
    pub async fn process(&self, job: &ResearchJob) -> Result<GenerationSummary, GenerationError> {
        let current = self.store.get(job.result_id).await?;
        let mut run = Run::new(job, &current);

        tracing::info!(
            result_id = %job.result_id,
            research_id = %job.research_id,
            "Generation started",
        );

        let outcome = match tokio::time::timeout(self.max_generation, self.drive(&mut run)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GenerationError::TimedOut(self.max_generation)),
        };

        match outcome {
            Ok(()) => {
                let summary = run.summary();
                tracing::info!(
                    result_id = %job.result_id,
                    chunks = summary.chunks,
                    content_length = summary.content_length,
                    sources = summary.sources,
                    "Generation completed",
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(result_id = %job.result_id, error = %e, "Generation failed");
                if let Err(store_err) = self.persist_fallback(&mut run, &e).await {
                    tracing::error!(
                        result_id = %job.result_id,
                        error = %store_err,
                        "Failed to persist fallback content",
                    );
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, run: &mut Run) -> Result<(), GenerationError> {
        let user = if run.user_id.is_empty() {
            self.default_user.clone()
        } else {
            run.user_id.clone()
        };
        let body = self
            .service
            .run(WorkflowRunRequest::streaming(&run.question, user))
            .await?;

        let mut stream = WorkflowStream::new(body);
        while let Some(event) = stream.next_event().await? {
            let finished = matches!(event, WorkflowEvent::WorkflowFinished(_));
            self.handle_event(run, event).await?;
            if finished {
                tracing::debug!(
                    result_id = %run.result_id,
                    bytes = stream.bytes_received(),
                    "Workflow stream finished",
                );
                return Ok(());
            }
        }
        Err(WorkflowError::PrematureEnd.into())
    }

    async fn handle_event(&self, run: &mut Run, event: WorkflowEvent) -> Result<(), GenerationError> {
        match event {
            WorkflowEvent::WorkflowStarted(data) => self.on_workflow_started(run, data).await,
            WorkflowEvent::NodeStarted(data) => self.on_node_started(run, data).await,
            WorkflowEvent::TextChunk(data) => self.on_text_chunk(run, data).await,
            WorkflowEvent::NodeFinished(data) => self.on_node_finished(run, data).await,
            WorkflowEvent::WorkflowFinished(data) => self.on_workflow_finished(run, data).await,
            WorkflowEvent::Ping => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    async fn on_workflow_started(
        &self,
        run: &mut Run,
        data: WorkflowStartedData,
    ) -> Result<(), GenerationError> {
        tracing::info!(
            result_id = %run.result_id,
            workflow_run_id = data.id.as_deref().unwrap_or("-"),
            "Workflow started",
        );

        let mut write = Write::default();
        let placeholder = format!("# {}\n\nGenerating research content...\n\n", run.question);
        run.set_content(&mut write, placeholder);
        run.set_status(&mut write, STATUS_STARTED, Some(PROGRESS_WORKFLOW_STARTED));
        self.persist(run, write).await
    }

    async fn on_node_started(
        &self,
        run: &mut Run,
        data: NodeStartedData,
    ) -> Result<(), GenerationError> {
        let title = [&data.title, &data.node_type, &data.node_id]
            .into_iter()
            .find(|t| !t.is_empty())
            .cloned()
            .unwrap_or_default();
        tracing::debug!(
            result_id = %run.result_id,
            node_id = %data.node_id,
            node_type = %data.node_type,
            title = %title,
            "Workflow step started",
        );

        run.tasks.push(Task {
            id: data.id,
            step_id: data.node_id,
            step_type: data.node_type,
            title: title.clone(),
            status: TaskStatus::Started,
            started_at: Utc::now(),
            finished_at: None,
            elapsed_time: None,
            token_usage: None,
            error: None,
        });

        let mut write = Write::default();
        write.patch.tasks = Some(run.tasks.clone());
        run.set_status(&mut write, &title, None);
        self.persist(run, write).await
    }

    async fn on_text_chunk(&self, run: &mut Run, data: TextChunkData) -> Result<(), GenerationError> {
        run.accumulated.push_str(&data.text);
        run.chunks += 1;

        let mut write = Write::default();
        let content = run.streamed_content();
        run.set_content(&mut write, content);
        run.set_status(&mut write, STATUS_GENERATING, Some(streaming_progress(run.chunks)));
        self.persist(run, write).await
    }

    async fn on_node_finished(
        &self,
        run: &mut Run,
        data: NodeFinishedData,
    ) -> Result<(), GenerationError> {
        let failure = data.failure();
        let mut write = Write::default();

        if let Some(raw) = &data.outputs {
            let extracted = outputs::extract(raw);
            if let Some(content) = extracted.content {
                run.step_content = Some(content);
            }
            if let Some(chart) = extracted.chart {
                run.chart.extend(chart);
            }
            if !extracted.sources.is_empty() {
                run.sources = extracted.sources.len();
                write.updates.push(ProgressUpdate::Sources {
                    sources: extracted.sources.clone(),
                });
                write.patch.sources = Some(extracted.sources);
            }
            if !extracted.related.is_empty() {
                write.updates.push(ProgressUpdate::Related {
                    related: extracted.related.clone(),
                });
                write.patch.related = Some(extracted.related);
            }
        }

        let outcome = TaskOutcome {
            elapsed_time: data.elapsed_time,
            token_usage: data.total_tokens(),
            error: failure.clone(),
        };
        match run.tasks.iter_mut().find(|t| t.id == data.id) {
            Some(task) => {
                if !task.finish(Utc::now(), outcome) {
                    tracing::warn!(
                        result_id = %run.result_id,
                        task_id = %data.id,
                        "Ignoring repeated step completion",
                    );
                }
            }
            None => {
                tracing::warn!(
                    result_id = %run.result_id,
                    task_id = %data.id,
                    node_id = %data.node_id,
                    "Step finished without a matching start",
                );
            }
        }
        write.patch.tasks = Some(run.tasks.clone());

        match failure {
            Some(error) => tracing::warn!(
                result_id = %run.result_id,
                node_id = %data.node_id,
                error = %error,
                "Workflow step failed",
            ),
            None => tracing::debug!(
                result_id = %run.result_id,
                node_id = %data.node_id,
                elapsed_time = data.elapsed_time.unwrap_or_default(),
                "Workflow step finished",
            ),
        }

        self.persist(run, write).await
    }

    async fn on_workflow_finished(
        &self,
        run: &mut Run,
        data: WorkflowFinishedData,
    ) -> Result<(), GenerationError> {
        let content = run
            .step_content
            .clone()
            .or_else(|| data.outputs.as_ref().and_then(outputs::workflow_content))
            .unwrap_or_else(|| {
                if run.accumulated.is_empty() {
                    run.missing_content(data.error.as_deref())
                } else {
                    run.streamed_content()
                }
            });

        let mut write = Write::default();
        run.set_content(&mut write, content);
        if !run.chart.is_empty() {
            let charts = serde_json::json!({ "charts": [Value::Object(run.chart.clone())] });
            write.updates.push(ProgressUpdate::Data {
                data: charts.clone(),
            });
            write.patch.data = Some(charts);
        }
        run.set_status(&mut write, STATUS_COMPLETED, Some(PROGRESS_COMPLETE));
        write.patch.is_complete = Some(true);
        write.updates.push(ProgressUpdate::Completed);

        tracing::info!(
            result_id = %run.result_id,
            workflow_status = data.status.as_deref().unwrap_or("-"),
            total_tokens = data.total_tokens.unwrap_or_default(),
            "Workflow finished",
        );
        self.persist(run, write).await
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    async fn persist_fallback(
        &self,
        run: &mut Run,
        error: &GenerationError,
    ) -> Result<(), GenerationError> {
        let mut write = Write::default();
        let content = format!(
            "# {}\n\n## Overview\n\nAn error occurred while generating the research content. \
             Please try again later.\n\nError: {error}",
            run.question
        );
        run.set_content(&mut write, content);
        run.set_status(&mut write, STATUS_FAILED, None);
        write.patch.is_complete = Some(false);
        write.updates.push(ProgressUpdate::Failed {
            message: error.to_string(),
        });
        self.persist(run, write).await
    }

    /// Write one partial update and publish its log entries.
    async fn persist(&self, run: &mut Run, write: Write) -> Result<(), GenerationError> {
        if write.patch.is_empty() && write.updates.is_empty() {
            return Ok(());
        }

        let row = self
            .store
            .record(run.result_id, write.patch, &write.updates)
            .await?;
        run.progress = row.progress;

        let first_seq = row.last_event_seq - write.updates.len() as i64 + 1;
        for (offset, update) in write.updates.into_iter().enumerate() {
            self.bus
                .publish(ProgressEvent::new(run.result_id, first_seq + offset as i64, update));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

/// One partial write: the patch plus the log entries describing it.
#[derive(Default)]
struct Write {
    patch: ResultPatch,
    updates: Vec<ProgressUpdate>,
}

/// State accumulated while one upstream run is consumed.
struct Run {
    result_id: EntityId,
    question: String,
    user_id: String,
    accumulated: String,
    chunks: u32,
    tasks: Vec<Task>,
    chart: Map<String, Value>,
    /// Final report announced by a step's outputs.
    step_content: Option<String>,
    /// Content as last written to the store.
    persisted_content: String,
    status: String,
    progress: i16,
    sources: usize,
}

impl Run {
    fn new(job: &ResearchJob, current: &ResearchResult) -> Self {
        Self {
            result_id: job.result_id,
            question: job.question.question.clone(),
            user_id: job.user_id.clone(),
            accumulated: String::new(),
            chunks: 0,
            tasks: Vec::new(),
            chart: Map::new(),
            step_content: None,
            persisted_content: current.markdown_content.clone(),
            status: current.status.clone(),
            progress: current.progress,
            sources: 0,
        }
    }

    fn streamed_content(&self) -> String {
        format!("# {}\n\n## Research Content\n\n{}", self.question, self.accumulated)
    }

    fn missing_content(&self, error: Option<&str>) -> String {
        let mut content = format!(
            "# {}\n\n## Overview\n\nNo research content was returned. Please try again later.",
            self.question
        );
        if let Some(error) = error.filter(|e| !e.is_empty()) {
            content.push_str(&format!("\n\nError: {error}"));
        }
        content
    }

    fn set_content(&mut self, write: &mut Write, content: String) {
        if let Some(update) = content_update(&self.persisted_content, &content) {
            write.updates.push(update);
            write.patch.markdown_content = Some(content.clone());
            self.persisted_content = content;
        }
    }

    /// Record a status change. Progress only moves forward; an update is
    /// logged only when the label or the value changed.
    fn set_status(&mut self, write: &mut Write, status: &str, progress: Option<i16>) {
        let progress = merge_progress(self.progress, progress);
        if status == self.status && progress == self.progress {
            return;
        }
        write.patch.status = Some(status.to_string());
        write.patch.progress = Some(progress);
        write.updates.push(ProgressUpdate::Status {
            status: status.to_string(),
            progress,
        });
        self.status = status.to_string();
        self.progress = progress;
    }

    fn summary(&self) -> GenerationSummary {
        GenerationSummary {
            result_id: self.result_id,
            chunks: self.chunks,
            content_length: self.persisted_content.len(),
            sources: self.sources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use quarry_core::progress::SequencedUpdate;
    use quarry_core::research::ResearchQuestion;
    use quarry_db::memory::MemoryResultStore;
    use quarry_db::models::research::NewResearch;
    use quarry_workflow::scripted::{frame, text_run, ScriptedGeneration, ScriptedRun};
    use serde_json::json;

    struct Harness {
        store: Arc<MemoryResultStore>,
        bus: Arc<ProgressBus>,
        service: Arc<ScriptedGeneration>,
        job: ResearchJob,
    }

    impl Harness {
        async fn new(runs: Vec<ScriptedRun>) -> Self {
            let store = Arc::new(MemoryResultStore::new());
            let (research, result) = store
                .create_research(NewResearch {
                    question: "Q1".into(),
                    user_id: Some("u1".into()),
                })
                .await
                .unwrap();
            Self {
                store,
                bus: Arc::new(ProgressBus::default()),
                service: Arc::new(ScriptedGeneration::new(runs)),
                job: ResearchJob {
                    research_id: research.id,
                    question: ResearchQuestion::new("Q1"),
                    user_id: "u1".into(),
                    result_id: result.id,
                },
            }
        }

        fn worker(&self) -> GenerationWorker {
            GenerationWorker::new(self.store.clone(), self.bus.clone(), self.service.clone())
        }

        async fn result(&self) -> ResearchResult {
            self.store.get(self.job.result_id).await.unwrap()
        }

        async fn log(&self) -> Vec<SequencedUpdate> {
            self.store
                .events_since(self.job.result_id, 0, 1000)
                .await
                .unwrap()
        }
    }

    fn body(events: &[Value]) -> ScriptedRun {
        ScriptedRun::Body(events.iter().map(|e| frame(e).into_bytes()).collect())
    }

    // -- Happy path ----------------------------------------------------------

    #[tokio::test]
    async fn streamed_chunks_become_complete_report() {
        let h = Harness::new(vec![text_run(&["A", "B", "C"])]).await;
        let summary = h.worker().process(&h.job).await.unwrap();

        let result = h.result().await;
        assert_eq!(result.markdown_content, "# Q1\n\n## Research Content\n\nABC");
        assert!(result.is_complete);
        assert_eq!(result.status, "completed");
        assert_eq!(result.progress, 100);
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.return_value()["status"], "success");

        let requests = h.service.requests().await;
        assert_eq!(requests[0].inputs.research_question, "Q1");
        assert_eq!(requests[0].user, "u1");
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let texts: Vec<String> = (0..30).map(|i| format!("t{i} ")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let h = Harness::new(vec![text_run(&refs)]).await;
        h.worker().process(&h.job).await.unwrap();

        let progress: Vec<i16> = h
            .log()
            .await
            .into_iter()
            .filter_map(|e| match e.update {
                ProgressUpdate::Status { progress, .. } => Some(progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress.first(), Some(&10));
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn split_frames_are_parsed_once() {
        let ScriptedRun::Body(frames) = text_run(&["气候", "变化"]) else {
            unreachable!()
        };
        let bytes: Vec<u8> = frames.concat();
        let chunks: Vec<Vec<u8>> = bytes.chunks(5).map(<[u8]>::to_vec).collect();
        let h = Harness::new(vec![ScriptedRun::Body(chunks)]).await;
        let summary = h.worker().process(&h.job).await.unwrap();

        assert_eq!(summary.chunks, 2);
        assert_eq!(
            h.result().await.markdown_content,
            "# Q1\n\n## Research Content\n\n气候变化"
        );
    }

    #[tokio::test]
    async fn log_records_content_as_deltas() {
        let h = Harness::new(vec![text_run(&["A", "B"])]).await;
        h.worker().process(&h.job).await.unwrap();

        let log = h.log().await;
        let seqs: Vec<i64> = log.iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(h.result().await.last_event_seq, *seqs.last().unwrap());

        let content: Vec<&ProgressUpdate> = log
            .iter()
            .map(|e| &e.update)
            .filter(|u| matches!(u, ProgressUpdate::ContentDelta { .. } | ProgressUpdate::ContentReplaced { .. }))
            .collect();
        assert_matches!(content[0], ProgressUpdate::ContentDelta { text } if text.starts_with("# Q1"));
        assert_matches!(content[1], ProgressUpdate::ContentReplaced { content } if content.ends_with("A"));
        assert_matches!(content[2], ProgressUpdate::ContentDelta { text } if text == "B");
        assert_matches!(log.last().map(|e| &e.update), Some(ProgressUpdate::Completed));
    }

    #[tokio::test]
    async fn published_events_match_the_log() {
        let h = Harness::new(vec![text_run(&["A"])]).await;
        let mut sub = h.bus.subscribe_result(h.job.result_id);
        h.worker().process(&h.job).await.unwrap();

        let mut published = Vec::new();
        loop {
            let event = sub.next().await.unwrap();
            let done = matches!(event.update, ProgressUpdate::Completed);
            published.push((event.seq, event.update));
            if done {
                break;
            }
        }
        let logged: Vec<(i64, ProgressUpdate)> =
            h.log().await.into_iter().map(|e| (e.seq, e.update)).collect();
        assert_eq!(published, logged);
    }

    // -- Steps and outputs ---------------------------------------------------

    #[tokio::test]
    async fn steps_are_recorded_as_tasks() {
        let h = Harness::new(vec![body(&[
            json!({"event": "workflow_started", "data": {}}),
            json!({"event": "node_started", "data": {"id": "e1", "node_id": "n1", "node_type": "llm", "title": "Search"}}),
            json!({"event": "node_finished", "data": {"id": "e1", "node_id": "n1", "status": "succeeded", "elapsed_time": 2.5, "execution_metadata": {"total_tokens": 40}}}),
            json!({"event": "node_started", "data": {"id": "e2", "node_id": "n2", "node_type": "tool", "title": "Fetch"}}),
            json!({"event": "node_finished", "data": {"id": "e2", "node_id": "n2", "status": "failed", "error": "timeout"}}),
            json!({"event": "node_finished", "data": {"id": "e2", "node_id": "n2", "status": "succeeded"}}),
            json!({"event": "text_chunk", "data": {"text": "A"}}),
            json!({"event": "workflow_finished", "data": {}}),
        ])])
        .await;
        h.worker().process(&h.job).await.unwrap();

        let tasks = h.result().await.tasks;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Finished);
        assert_eq!(tasks[0].title, "Search");
        assert_eq!(tasks[0].elapsed_time, Some(2.5));
        assert_eq!(tasks[0].token_usage, Some(40));
        assert_eq!(tasks[1].status, TaskStatus::Failed);
        assert_eq!(tasks[1].error.as_deref(), Some("timeout"));

        let statuses: Vec<String> = h
            .log()
            .await
            .into_iter()
            .filter_map(|e| match e.update {
                ProgressUpdate::Status { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert!(statuses.contains(&"Search".to_string()));
    }

    #[tokio::test]
    async fn structured_outputs_are_merged() {
        let h = Harness::new(vec![body(&[
            json!({"event": "workflow_started", "data": {}}),
            json!({"event": "node_started", "data": {"id": "e1", "node_id": "n1"}}),
            json!({"event": "node_finished", "data": {"id": "e1", "node_id": "n1", "outputs": {
                "sources": [{"title": "Paper", "url": "https://a.example"}],
                "related": "[{\"title\":\"Next\"}]",
                "chart_data": "{\"type\":\"bar\"}"
            }}}),
            json!({"event": "node_started", "data": {"id": "e2", "node_id": "n2"}}),
            json!({"event": "node_finished", "data": {"id": "e2", "node_id": "n2", "outputs": {
                "sources": [],
                "research_content": "# Final report"
            }}}),
            json!({"event": "text_chunk", "data": {"text": "draft"}}),
            json!({"event": "workflow_finished", "data": {}}),
        ])])
        .await;
        h.worker().process(&h.job).await.unwrap();

        let result = h.result().await;
        assert_eq!(result.markdown_content, "# Final report");
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.sources[0].title, "Paper");
        assert_eq!(result.related[0].title, "Next");
        assert_eq!(result.data.unwrap()["charts"][0]["type"], "bar");
        assert!(result.is_complete);
    }

    #[tokio::test]
    async fn workflow_outputs_are_used_without_text() {
        let h = Harness::new(vec![body(&[
            json!({"event": "workflow_started", "data": {}}),
            json!({"event": "workflow_finished", "data": {"outputs": {"answer": "Direct answer"}}}),
        ])])
        .await;
        h.worker().process(&h.job).await.unwrap();
        assert_eq!(h.result().await.markdown_content, "Direct answer");
    }

    #[tokio::test]
    async fn missing_content_becomes_placeholder() {
        let h = Harness::new(vec![body(&[
            json!({"event": "workflow_started", "data": {}}),
            json!({"event": "workflow_finished", "data": {"status": "failed", "error": "quota exceeded"}}),
        ])])
        .await;
        h.worker().process(&h.job).await.unwrap();

        let result = h.result().await;
        assert!(result.markdown_content.contains("No research content was returned"));
        assert!(result.markdown_content.contains("quota exceeded"));
        assert!(result.is_complete);
    }

    // -- Failures ------------------------------------------------------------

    #[tokio::test]
    async fn upstream_error_persists_fallback() {
        let h = Harness::new(vec![ScriptedRun::Status {
            status: 500,
            body: "boom".into(),
        }])
        .await;
        let err = h.worker().process(&h.job).await.unwrap_err();
        assert_matches!(err, GenerationError::Workflow(WorkflowError::Api { status: 500, .. }));

        let result = h.result().await;
        assert!(!result.is_complete);
        assert_eq!(result.status, "failed");
        assert!(result.markdown_content.contains("An error occurred"));
        assert_matches!(
            h.log().await.last().map(|e| &e.update),
            Some(ProgressUpdate::Failed { message }) if message.contains("500")
        );
    }

    #[tokio::test]
    async fn stream_ending_early_fails() {
        let h = Harness::new(vec![body(&[
            json!({"event": "workflow_started", "data": {}}),
            json!({"event": "text_chunk", "data": {"text": "A"}}),
        ])])
        .await;
        let err = h.worker().process(&h.job).await.unwrap_err();
        assert_matches!(err, GenerationError::Workflow(WorkflowError::PrematureEnd));
        assert!(!h.result().await.is_complete);
    }

    #[tokio::test]
    async fn unknown_event_fails() {
        let h = Harness::new(vec![body(&[
            json!({"event": "workflow_started", "data": {}}),
            json!({"event": "agent_thought", "data": {}}),
        ])])
        .await;
        let err = h.worker().process(&h.job).await.unwrap_err();
        assert_matches!(err, GenerationError::Workflow(WorkflowError::Frame(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn generation_time_is_bounded() {
        let store = Arc::new(MemoryResultStore::new());
        let (research, result) = store
            .create_research(NewResearch {
                question: "Q1".into(),
                user_id: None,
            })
            .await
            .unwrap();
        let service = Arc::new(
            ScriptedGeneration::new([text_run(&["A", "B", "C"])])
                .with_chunk_delay(Duration::from_secs(10)),
        );
        let worker = GenerationWorker::new(store.clone(), Arc::new(ProgressBus::default()), service.clone())
            .with_max_generation(Duration::from_secs(25));
        let job = ResearchJob {
            research_id: research.id,
            question: ResearchQuestion::new("Q1"),
            user_id: String::new(),
            result_id: result.id,
        };

        let err = worker.process(&job).await.unwrap_err();
        assert_matches!(err, GenerationError::TimedOut(_));
        assert_eq!(store.get(result.id).await.unwrap().status, "failed");
        assert_eq!(service.requests().await[0].user, "research-worker");
    }

    #[tokio::test]
    async fn retry_restarts_from_scratch() {
        let h = Harness::new(vec![
            body(&[
                json!({"event": "workflow_started", "data": {}}),
                json!({"event": "text_chunk", "data": {"text": "partial"}}),
            ]),
            text_run(&["A", "B", "C"]),
        ])
        .await;
        let worker = h.worker();
        assert!(worker.process(&h.job).await.is_err());
        worker.process(&h.job).await.unwrap();

        let result = h.result().await;
        assert_eq!(result.markdown_content, "# Q1\n\n## Research Content\n\nABC");
        assert!(!result.markdown_content.contains("partial"));
        assert_eq!(h.service.calls(), 2);
    }
}
