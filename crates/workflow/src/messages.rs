//! Upstream workflow event types and parser.
//!
//! Each frame's `data:` lines carry one JSON document shaped
//! `{"event": "<kind>", "data": {...}, ...}`. This module decodes it into
//! the closed [`WorkflowEvent`] enum; any other `event` value fails loudly.

use serde::Deserialize;

use crate::frames::FrameError;

/// All upstream workflow events the worker understands.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum WorkflowEvent {
    /// The workflow run has started.
    #[serde(rename = "workflow_started")]
    WorkflowStarted(WorkflowStartedData),

    /// A workflow step began executing.
    #[serde(rename = "node_started")]
    NodeStarted(NodeStartedData),

    /// A piece of generated text.
    #[serde(rename = "text_chunk")]
    TextChunk(TextChunkData),

    /// A workflow step finished, possibly with structured outputs.
    #[serde(rename = "node_finished")]
    NodeFinished(NodeFinishedData),

    /// The workflow run finished; no further events follow.
    #[serde(rename = "workflow_finished")]
    WorkflowFinished(WorkflowFinishedData),

    /// Keep-alive sent as a JSON payload.
    #[serde(rename = "ping")]
    Ping,
}

/// Event names accepted by [`parse_frame`].
pub const KNOWN_EVENTS: [&str; 6] = [
    "workflow_started",
    "node_started",
    "text_chunk",
    "node_finished",
    "workflow_finished",
    "ping",
];

/// Payload for `workflow_started`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowStartedData {
    /// Workflow run id.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
}

/// Payload for `node_started`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeStartedData {
    /// Execution id of this step; matches the `node_finished` id.
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub title: String,
}

/// Payload for `text_chunk`.
#[derive(Debug, Clone, Deserialize)]
pub struct TextChunkData {
    pub text: String,
}

/// Token accounting attached to a finished step.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub total_tokens: Option<i64>,
}

/// Payload for `node_finished`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeFinishedData {
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub title: String,
    /// `succeeded`, `failed` or `stopped`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub outputs: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub elapsed_time: Option<f64>,
    #[serde(default)]
    pub execution_metadata: Option<ExecutionMetadata>,
}

impl NodeFinishedData {
    /// Error message if the step did not succeed.
    pub fn failure(&self) -> Option<String> {
        match (&self.error, self.status.as_deref()) {
            (Some(error), _) if !error.is_empty() => Some(error.clone()),
            (_, Some("failed")) => Some("step failed".to_string()),
            _ => None,
        }
    }

    pub fn total_tokens(&self) -> Option<i64> {
        self.execution_metadata.as_ref().and_then(|m| m.total_tokens)
    }
}

/// Payload for `workflow_finished`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowFinishedData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub outputs: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub elapsed_time: Option<f64>,
    #[serde(default)]
    pub total_tokens: Option<i64>,
}

/// Parse one frame into a workflow event.
///
/// The frame's `data:` lines are joined with `\n` to form the JSON
/// document. Returns `Ok(None)` for keep-alive frames that carry no `data:`
/// line (comments, `event: ping`). Malformed JSON, a missing `event` field
/// and unknown event kinds are errors.
pub fn parse_frame(frame: &str) -> Result<Option<WorkflowEvent>, FrameError> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if data_lines.is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(&data_lines.join("\n"))?;
    let kind = value
        .get("event")
        .and_then(|e| e.as_str())
        .ok_or(FrameError::MissingEvent)?;
    if !KNOWN_EVENTS.contains(&kind) {
        return Err(FrameError::UnknownEvent(kind.to_string()));
    }

    Ok(Some(serde_json::from_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_workflow_started() {
        let frame = r#"data: {"event":"workflow_started","task_id":"t","workflow_run_id":"r1","data":{"id":"r1","workflow_id":"w"}}"#;
        match parse_frame(frame).unwrap() {
            Some(WorkflowEvent::WorkflowStarted(data)) => {
                assert_eq!(data.id.as_deref(), Some("r1"));
            }
            other => panic!("Expected WorkflowStarted, got {other:?}"),
        }
    }

    #[test]
    fn parse_text_chunk_without_space_after_colon() {
        let frame = r#"data:{"event":"text_chunk","data":{"text":"A"}}"#;
        assert_matches!(
            parse_frame(frame).unwrap(),
            Some(WorkflowEvent::TextChunk(TextChunkData { text })) if text == "A"
        );
    }

    #[test]
    fn parse_node_started() {
        let frame = r#"data: {"event":"node_started","data":{"id":"e1","node_id":"n1","node_type":"llm","title":"Search the web","index":2}}"#;
        match parse_frame(frame).unwrap() {
            Some(WorkflowEvent::NodeStarted(data)) => {
                assert_eq!(data.id, "e1");
                assert_eq!(data.node_type, "llm");
                assert_eq!(data.title, "Search the web");
            }
            other => panic!("Expected NodeStarted, got {other:?}"),
        }
    }

    #[test]
    fn parse_node_finished_with_outputs() {
        let frame = r#"data: {"event":"node_finished","data":{"id":"e1","node_id":"n1","status":"succeeded","outputs":{"content":"X"},"elapsed_time":1.25,"execution_metadata":{"total_tokens":42}}}"#;
        match parse_frame(frame).unwrap() {
            Some(WorkflowEvent::NodeFinished(data)) => {
                assert_eq!(data.outputs.unwrap()["content"], "X");
                assert_eq!(data.elapsed_time, Some(1.25));
                assert_eq!(data.execution_metadata.unwrap().total_tokens, Some(42));
            }
            other => panic!("Expected NodeFinished, got {other:?}"),
        }
    }

    #[test]
    fn node_failure_from_status_or_error() {
        let failed: NodeFinishedData = serde_json::from_str(
            r#"{"id":"e","node_id":"n","status":"failed","error":"timeout"}"#,
        )
        .unwrap();
        assert_eq!(failed.failure().as_deref(), Some("timeout"));

        let no_message: NodeFinishedData =
            serde_json::from_str(r#"{"id":"e","node_id":"n","status":"failed"}"#).unwrap();
        assert!(no_message.failure().is_some());

        let ok: NodeFinishedData =
            serde_json::from_str(r#"{"id":"e","node_id":"n","status":"succeeded"}"#).unwrap();
        assert!(ok.failure().is_none());
    }

    #[test]
    fn parse_workflow_finished() {
        let frame = r#"data: {"event":"workflow_finished","data":{"status":"succeeded","outputs":{"answer":"done"}}}"#;
        match parse_frame(frame).unwrap() {
            Some(WorkflowEvent::WorkflowFinished(data)) => {
                assert_eq!(data.status.as_deref(), Some("succeeded"));
                assert_eq!(data.outputs.unwrap()["answer"], "done");
            }
            other => panic!("Expected WorkflowFinished, got {other:?}"),
        }
    }

    #[test]
    fn multi_line_data_is_joined() {
        let frame = "data: {\"event\":\"text_chunk\",\ndata: \"data\":{\"text\":\"B\"}}";
        assert_matches!(
            parse_frame(frame).unwrap(),
            Some(WorkflowEvent::TextChunk(TextChunkData { text })) if text == "B"
        );
    }

    #[test]
    fn keep_alive_frames_are_skipped() {
        assert!(parse_frame("event: ping").unwrap().is_none());
        assert!(parse_frame(": comment").unwrap().is_none());
        assert_matches!(
            parse_frame(r#"data: {"event":"ping"}"#).unwrap(),
            Some(WorkflowEvent::Ping)
        );
    }

    #[test]
    fn unknown_event_is_an_error() {
        let frame = r#"data: {"event":"tts_message","data":{}}"#;
        assert_matches!(parse_frame(frame), Err(FrameError::UnknownEvent(kind)) if kind == "tts_message");
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert_matches!(parse_frame("data: {not json"), Err(FrameError::Malformed(_)));
        assert_matches!(parse_frame(r#"data: {"data":{}}"#), Err(FrameError::MissingEvent));
    }
}
