//! Research and research result models.

use quarry_core::research::{
    merge_batch, merge_progress, select_current, RelatedItem, Source, Task, Versioned,
    STATUS_INITIALIZING,
};
use quarry_core::types::{EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `research` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Research {
    pub id: EntityId,
    pub title: String,
    pub question: String,
    pub user_id: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A row from the `research_results` table: one generation attempt.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct ResearchResult {
    pub id: EntityId,
    pub research_id: EntityId,
    pub version: i32,
    pub markdown_content: String,
    pub data: Option<serde_json::Value>,
    #[sqlx(json)]
    pub sources: Vec<Source>,
    #[sqlx(json)]
    pub related: Vec<RelatedItem>,
    #[sqlx(json)]
    pub tasks: Vec<Task>,
    pub status: String,
    pub is_complete: bool,
    pub progress: i16,
    /// Sequence of the last entry appended to this result's progress log.
    pub last_event_seq: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ResearchResult {
    /// A freshly created, empty result.
    pub fn initial(id: EntityId, research_id: EntityId, version: i32, now: Timestamp) -> Self {
        Self {
            id,
            research_id,
            version,
            markdown_content: String::new(),
            data: None,
            sources: Vec::new(),
            related: Vec::new(),
            tasks: Vec::new(),
            status: STATUS_INITIALIZING.to_string(),
            is_complete: false,
            progress: 0,
            last_event_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a patch into this result using the store merge policies.
    ///
    /// Absent fields are untouched, empty batches are ignored and progress
    /// never decreases.
    pub fn apply(&mut self, patch: &ResultPatch, now: Timestamp) {
        if let Some(content) = &patch.markdown_content {
            self.markdown_content.clone_from(content);
        }
        if let Some(data) = &patch.data {
            self.data = Some(data.clone());
        }
        self.sources = merge_batch(&self.sources, patch.sources.as_deref());
        self.related = merge_batch(&self.related, patch.related.as_deref());
        self.tasks = merge_batch(&self.tasks, patch.tasks.as_deref());
        if let Some(status) = &patch.status {
            self.status.clone_from(status);
        }
        if let Some(is_complete) = patch.is_complete {
            self.is_complete = is_complete;
        }
        self.progress = merge_progress(self.progress, patch.progress);
        self.updated_at = now;
    }
}

impl Versioned for ResearchResult {
    fn version(&self) -> i32 {
        self.version
    }

    fn is_complete(&self) -> bool {
        self.is_complete
    }
}

/// Partial update of a result. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultPatch {
    pub markdown_content: Option<String>,
    pub data: Option<serde_json::Value>,
    pub sources: Option<Vec<Source>>,
    pub related: Option<Vec<RelatedItem>>,
    pub tasks: Option<Vec<Task>>,
    pub status: Option<String>,
    pub is_complete: Option<bool>,
    pub progress: Option<i16>,
}

impl ResultPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// DTO for creating a research together with its first result.
#[derive(Debug, Clone, Deserialize)]
pub struct NewResearch {
    pub question: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// A research with every result version (ascending) and its current result.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchDetail {
    pub research: Research,
    pub results: Vec<ResearchResult>,
    pub current_result: Option<ResearchResult>,
}

impl ResearchDetail {
    /// Build a detail view; `results` are sorted by version ascending.
    pub fn new(research: Research, mut results: Vec<ResearchResult>) -> Self {
        results.sort_by_key(|r| r.version);
        let current_result = select_current(&results).cloned();
        Self {
            research,
            results,
            current_result,
        }
    }
}

/// List entry: a research and its current result.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchSummary {
    #[serde(flatten)]
    pub research: Research,
    pub current_result: Option<ResearchResult>,
}

/// A row from the `result_events` table. `payload` holds a serialized
/// `ProgressUpdate`.
#[derive(Debug, Clone, FromRow)]
pub struct ResultEventRow {
    pub seq: i64,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: &str) -> Source {
        Source {
            id: id.into(),
            source_id: id.into(),
            title: format!("Title {id}"),
            url: format!("https://example.org/{id}"),
            source: "web".into(),
        }
    }

    fn result(version: i32, complete: bool) -> ResearchResult {
        let mut r = ResearchResult::initial(
            uuid::Uuid::new_v4(),
            uuid::Uuid::nil(),
            version,
            chrono::Utc::now(),
        );
        r.is_complete = complete;
        r
    }

    #[test]
    fn absent_fields_are_untouched() {
        let mut r = result(1, false);
        r.markdown_content = "kept".into();
        r.apply(
            &ResultPatch {
                status: Some("Searching".into()),
                ..Default::default()
            },
            chrono::Utc::now(),
        );
        assert_eq!(r.markdown_content, "kept");
        assert_eq!(r.status, "Searching");
    }

    #[test]
    fn empty_sources_do_not_clear_stored_sources() {
        let mut r = result(1, false);
        r.apply(
            &ResultPatch {
                sources: Some(vec![source("a")]),
                ..Default::default()
            },
            chrono::Utc::now(),
        );
        r.apply(
            &ResultPatch {
                sources: Some(vec![]),
                related: Some(vec![]),
                ..Default::default()
            },
            chrono::Utc::now(),
        );
        assert_eq!(r.sources, vec![source("a")]);
        assert!(r.related.is_empty());
    }

    #[test]
    fn progress_is_monotonic_through_apply() {
        let mut r = result(1, false);
        for p in [10, 30, 20, 80, 50] {
            r.apply(
                &ResultPatch {
                    progress: Some(p),
                    ..Default::default()
                },
                chrono::Utc::now(),
            );
        }
        assert_eq!(r.progress, 80);
    }

    #[test]
    fn detail_sorts_results_and_picks_current() {
        let research = Research {
            id: uuid::Uuid::nil(),
            title: "Q".into(),
            question: "Q".into(),
            user_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let detail = ResearchDetail::new(
            research,
            vec![result(3, false), result(1, false), result(2, true)],
        );
        let versions: Vec<i32> = detail.results.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(detail.current_result.map(|r| r.version), Some(2));
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(ResultPatch::default().is_empty());
        assert!(!ResultPatch {
            is_complete: Some(true),
            ..Default::default()
        }
        .is_empty());
    }
}
