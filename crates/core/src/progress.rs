//! Progress updates recorded while a result is being generated.
//!
//! Every partial write the worker performs is paired with one or more
//! [`ProgressUpdate`]s. Stores append them to a per-result log numbered by
//! a strictly increasing sequence, so relay consumers can resume from the
//! last sequence they saw instead of diffing content.

use serde::{Deserialize, Serialize};

use crate::research::{RelatedItem, Source};
use crate::types::Timestamp;

/// Progress written when the upstream workflow starts.
pub const PROGRESS_WORKFLOW_STARTED: i16 = 10;

/// Lower bound of the progress range used while text is streaming.
pub const PROGRESS_STREAM_FLOOR: i16 = 20;

/// Upper bound of the progress range used while text is streaming.
pub const PROGRESS_STREAM_CEILING: i16 = 80;

/// Progress of a completed result.
pub const PROGRESS_COMPLETE: i16 = 100;

/// Progress for the `chunks`-th streamed text chunk.
///
/// Grows by one point every two chunks and saturates at
/// [`PROGRESS_STREAM_CEILING`].
pub fn streaming_progress(chunks: u32) -> i16 {
    let step = (chunks / 2).min(PROGRESS_STREAM_CEILING as u32) as i16;
    (PROGRESS_STREAM_FLOOR + step).min(PROGRESS_STREAM_CEILING)
}

/// One persisted progress fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ProgressUpdate {
    /// Free-text status label plus the progress value written with it.
    Status { status: String, progress: i16 },
    /// Text appended to the previously recorded content.
    ContentDelta { text: String },
    /// Content replaced wholesale.
    ContentReplaced { content: String },
    Sources { sources: Vec<Source> },
    Related { related: Vec<RelatedItem> },
    Data { data: serde_json::Value },
    /// The result reached `is_complete = true`.
    Completed,
    /// A generation attempt failed; the job may still be retried.
    Failed { message: String },
}

impl ProgressUpdate {
    /// Stable name of the variant, used as the log's `kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::ContentDelta { .. } => "content_delta",
            Self::ContentReplaced { .. } => "content_replaced",
            Self::Sources { .. } => "sources",
            Self::Related { .. } => "related",
            Self::Data { .. } => "data",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// A [`ProgressUpdate`] with its position in a result's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedUpdate {
    pub seq: i64,
    pub update: ProgressUpdate,
    pub created_at: Timestamp,
}

/// Describe the change from `previous` to `next` content.
///
/// Returns `None` when nothing changed, a delta when `next` extends
/// `previous`, and a full replacement otherwise.
pub fn content_update(previous: &str, next: &str) -> Option<ProgressUpdate> {
    if previous == next {
        return None;
    }
    match next.strip_prefix(previous) {
        Some(appended) => Some(ProgressUpdate::ContentDelta {
            text: appended.to_string(),
        }),
        None => Some(ProgressUpdate::ContentReplaced {
            content: next.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn streaming_progress_stays_in_range() {
        assert_eq!(streaming_progress(0), 20);
        assert_eq!(streaming_progress(1), 20);
        assert_eq!(streaming_progress(2), 21);
        assert_eq!(streaming_progress(120), 80);
        assert_eq!(streaming_progress(u32::MAX), 80);
    }

    #[test]
    fn streaming_progress_is_monotonic() {
        let values: Vec<i16> = (0..200).map(streaming_progress).collect();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn unchanged_content_yields_nothing() {
        assert!(content_update("abc", "abc").is_none());
    }

    #[test]
    fn appended_content_yields_delta() {
        assert_matches!(
            content_update("# Q\n\nA", "# Q\n\nAB"),
            Some(ProgressUpdate::ContentDelta { text }) if text == "B"
        );
    }

    #[test]
    fn appended_multibyte_content_yields_delta() {
        assert_matches!(
            content_update("气候", "气候变化"),
            Some(ProgressUpdate::ContentDelta { text }) if text == "变化"
        );
    }

    #[test]
    fn rewritten_content_yields_replacement() {
        assert_matches!(
            content_update("placeholder", "# Q\n\nA"),
            Some(ProgressUpdate::ContentReplaced { content }) if content == "# Q\n\nA"
        );
    }

    #[test]
    fn update_serializes_with_kind_tag() {
        let json = serde_json::to_value(ProgressUpdate::ContentDelta { text: "x".into() }).unwrap();
        assert_eq!(json["kind"], "content_delta");
        assert_eq!(json["payload"]["text"], "x");

        let back: ProgressUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), "content_delta");
    }

    #[test]
    fn completed_round_trips_without_payload() {
        let json = serde_json::to_value(ProgressUpdate::Completed).unwrap();
        assert_eq!(json["kind"], "completed");
        let back: ProgressUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(back, ProgressUpdate::Completed);
    }
}
