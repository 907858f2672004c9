//! Typed frames written to a relay client.

use axum::response::sse::Event;
use chrono::Utc;
use quarry_core::progress::{ProgressUpdate, SequencedUpdate};
use quarry_core::research::{RelatedItem, Source, STATUS_FAILED, STATUS_STARTED};
use quarry_core::stream_events::{
    EVENT_COMPLETE, EVENT_CONNECTED, EVENT_CONTENT, EVENT_DATA, EVENT_ERROR, EVENT_HEARTBEAT,
    EVENT_RELATED, EVENT_SOURCES, EVENT_START, EVENT_STATUS,
};
use quarry_core::types::EntityId;
use serde_json::{json, Value};

/// One Server-Sent Event: name, JSON payload and, for frames read from the
/// progress log, the log sequence as the event id.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayFrame {
    pub event: &'static str,
    pub data: Value,
    pub id: Option<i64>,
}

impl RelayFrame {
    fn new(event: &'static str, data: Value) -> Self {
        Self {
            event,
            data,
            id: None,
        }
    }

    pub fn connected(result_id: EntityId) -> Self {
        Self::new(
            EVENT_CONNECTED,
            json!({
                "message": format!("Connected to result {result_id}"),
                "timestamp": Utc::now(),
            }),
        )
    }

    /// `start` for the started label, `status` for every other one.
    pub fn status(status: &str, progress: Option<i16>) -> Self {
        let event = if status == STATUS_STARTED {
            EVENT_START
        } else {
            EVENT_STATUS
        };
        let mut data = json!({ "status": status });
        if let Some(progress) = progress {
            data["progress"] = json!(progress);
        }
        Self::new(event, data)
    }

    /// A failed generation attempt that may still be retried.
    pub fn attempt_failed(message: &str) -> Self {
        Self::new(
            EVENT_STATUS,
            json!({ "status": STATUS_FAILED, "message": message }),
        )
    }

    /// Appended text, or the full content when `replace` is set.
    pub fn content(content: &str, replace: bool) -> Self {
        let mut data = json!({ "content": content });
        if replace {
            data["replace"] = json!(true);
        }
        Self::new(EVENT_CONTENT, data)
    }

    pub fn sources(sources: &[Source]) -> Self {
        Self::new(EVENT_SOURCES, json!({ "sources": sources }))
    }

    pub fn related(related: &[RelatedItem]) -> Self {
        Self::new(EVENT_RELATED, json!({ "related": related }))
    }

    pub fn data(data: &Value) -> Self {
        Self::new(EVENT_DATA, json!({ "data": data }))
    }

    pub fn heartbeat() -> Self {
        Self::new(EVENT_HEARTBEAT, json!({ "timestamp": Utc::now() }))
    }

    pub fn complete(result_id: EntityId) -> Self {
        Self::new(
            EVENT_COMPLETE,
            json!({ "resultId": result_id, "timestamp": Utc::now() }),
        )
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EVENT_ERROR, json!({ "message": message.into() }))
    }

    /// Frame for one logged update.
    pub fn from_update(result_id: EntityId, update: &ProgressUpdate) -> Self {
        match update {
            ProgressUpdate::Status { status, progress } => Self::status(status, Some(*progress)),
            ProgressUpdate::ContentDelta { text } => Self::content(text, false),
            ProgressUpdate::ContentReplaced { content } => Self::content(content, true),
            ProgressUpdate::Sources { sources } => Self::sources(sources),
            ProgressUpdate::Related { related } => Self::related(related),
            ProgressUpdate::Data { data } => Self::data(data),
            ProgressUpdate::Completed => Self::complete(result_id),
            ProgressUpdate::Failed { message } => Self::attempt_failed(message),
        }
    }

    pub fn with_id(mut self, seq: i64) -> Self {
        self.id = Some(seq);
        self
    }

    pub fn to_event(&self) -> Event {
        let mut event = Event::default().event(self.event).data(self.data.to_string());
        if let Some(id) = self.id {
            event = event.id(id.to_string());
        }
        event
    }
}

/// Merge runs of consecutive content updates so a client receives one
/// `content` frame per run.
///
/// Deltas following a delta are concatenated; deltas following a
/// replacement extend the replacement. Each merged entry keeps the sequence
/// of its last constituent.
pub fn coalesce(entries: Vec<SequencedUpdate>) -> Vec<SequencedUpdate> {
    let mut merged: Vec<SequencedUpdate> = Vec::with_capacity(entries.len());
    for entry in entries {
        if let ProgressUpdate::ContentDelta { text } = &entry.update {
            if let Some(last) = merged.last_mut() {
                let extended = match &mut last.update {
                    ProgressUpdate::ContentDelta { text: acc } => {
                        acc.push_str(text);
                        true
                    }
                    ProgressUpdate::ContentReplaced { content } => {
                        content.push_str(text);
                        true
                    }
                    _ => false,
                };
                if extended {
                    last.seq = entry.seq;
                    last.created_at = entry.created_at;
                    continue;
                }
            }
        }
        merged.push(entry);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn entry(seq: i64, update: ProgressUpdate) -> SequencedUpdate {
        SequencedUpdate {
            seq,
            update,
            created_at: Utc::now(),
        }
    }

    fn delta(text: &str) -> ProgressUpdate {
        ProgressUpdate::ContentDelta { text: text.into() }
    }

    #[test]
    fn consecutive_deltas_merge_into_one() {
        let merged = coalesce(vec![entry(4, delta("B")), entry(5, delta("C"))]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].seq, 5);
        assert_matches!(&merged[0].update, ProgressUpdate::ContentDelta { text } if text == "BC");
    }

    #[test]
    fn deltas_extend_a_replacement() {
        let merged = coalesce(vec![
            entry(1, ProgressUpdate::ContentReplaced { content: "# Q".into() }),
            entry(2, delta("\n\nA")),
        ]);
        assert_eq!(merged.len(), 1);
        assert_matches!(
            &merged[0].update,
            ProgressUpdate::ContentReplaced { content } if content == "# Q\n\nA"
        );
    }

    #[test]
    fn other_updates_break_a_run() {
        let merged = coalesce(vec![
            entry(1, delta("A")),
            entry(
                2,
                ProgressUpdate::Status {
                    status: "generating".into(),
                    progress: 20,
                },
            ),
            entry(3, delta("B")),
        ]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.iter().map(|e| e.seq).collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[test]
    fn started_status_is_a_start_frame() {
        assert_eq!(RelayFrame::status("started", Some(10)).event, "start");
        let frame = RelayFrame::status("generating", None);
        assert_eq!(frame.event, "status");
        assert!(frame.data.get("progress").is_none());
    }

    #[test]
    fn replacement_is_flagged() {
        let frame = RelayFrame::from_update(uuid::Uuid::nil(), &ProgressUpdate::ContentReplaced {
            content: "x".into(),
        });
        assert_eq!(frame.data["replace"], true);
        assert!(RelayFrame::content("x", false).data.get("replace").is_none());
    }

    #[test]
    fn complete_frame_carries_result_id() {
        let id = uuid::Uuid::nil();
        let frame = RelayFrame::from_update(id, &ProgressUpdate::Completed).with_id(9);
        assert_eq!(frame.event, "complete");
        assert_eq!(frame.data["resultId"], id.to_string());
        assert_eq!(frame.id, Some(9));
    }
}
