//! Research domain values and the pure policies that govern them.
//!
//! The storage rows themselves live in `quarry-db`; this module holds the
//! value types embedded in those rows (sources, related items, tasks) and
//! the rules every store adapter must agree on.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a submitted research question, in characters.
pub const MAX_QUESTION_LEN: usize = 4000;

/// Maximum length of a derived research title, in characters.
pub const MAX_TITLE_LEN: usize = 200;

/// Status label written when a result row is first created.
pub const STATUS_INITIALIZING: &str = "initializing";

/// Status label written when the upstream workflow starts.
pub const STATUS_STARTED: &str = "started";

/// Status label written when generation completes.
pub const STATUS_COMPLETED: &str = "completed";

/// Status label written when a generation attempt fails.
pub const STATUS_FAILED: &str = "failed";

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// The question a generation job answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchQuestion {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ResearchQuestion {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            model: None,
        }
    }
}

/// A cited source attached to a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub source_id: String,
    pub title: String,
    pub url: String,
    pub source: String,
}

/// A related research item attached to a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedItem {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Lifecycle of one recorded workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Started,
    Finished,
    Failed,
}

/// One recorded step of a generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub step_id: String,
    pub step_type: String,
    pub title: String,
    pub status: TaskStatus,
    pub started_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Seconds reported by the upstream service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Completion details for [`Task::finish`].
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub elapsed_time: Option<f64>,
    pub token_usage: Option<i64>,
    pub error: Option<String>,
}

impl Task {
    /// Transition a started task to `finished` (or `failed` when the outcome
    /// carries an error).
    ///
    /// Returns `false` without touching the task if it already left the
    /// `started` state; a step finishes exactly once.
    pub fn finish(&mut self, at: Timestamp, outcome: TaskOutcome) -> bool {
        if self.status != TaskStatus::Started {
            return false;
        }
        self.status = if outcome.error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Finished
        };
        self.finished_at = Some(at);
        self.elapsed_time = outcome.elapsed_time;
        self.token_usage = outcome.token_usage;
        self.error = outcome.error;
        true
    }
}

// ---------------------------------------------------------------------------
// Version selection
// ---------------------------------------------------------------------------

/// Anything that carries a result version and a completion flag.
pub trait Versioned {
    fn version(&self) -> i32;
    fn is_complete(&self) -> bool;
}

/// Pick the "current" result of a research.
///
/// The highest-version complete result wins; if none is complete, the
/// highest-version result overall (which may still be generating).
pub fn select_current<T: Versioned>(results: &[T]) -> Option<&T> {
    results
        .iter()
        .filter(|r| r.is_complete())
        .max_by_key(|r| r.version())
        .or_else(|| results.iter().max_by_key(|r| r.version()))
}

/// The version number a new result for a research should receive.
pub fn next_version(current_max: Option<i32>) -> i32 {
    current_max.unwrap_or(0) + 1
}

// ---------------------------------------------------------------------------
// Merge policies
// ---------------------------------------------------------------------------

/// Resolve an incoming attachment batch against the stored one.
///
/// An empty incoming batch means "no new data", never "clear".
pub fn merge_batch<T: Clone>(stored: &[T], incoming: Option<&[T]>) -> Vec<T> {
    match incoming {
        Some(batch) if !batch.is_empty() => batch.to_vec(),
        _ => stored.to_vec(),
    }
}

/// Resolve an incoming progress value against the stored one.
///
/// Progress never moves backwards and is kept within `0..=100`.
pub fn merge_progress(stored: i16, incoming: Option<i16>) -> i16 {
    match incoming {
        Some(p) => stored.max(p.clamp(0, 100)),
        None => stored,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a submitted question and return it trimmed.
pub fn validate_question(question: &str) -> Result<&str, CoreError> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation("Question must not be empty".into()));
    }
    if trimmed.chars().count() > MAX_QUESTION_LEN {
        return Err(CoreError::Validation(format!(
            "Question must not exceed {MAX_QUESTION_LEN} characters"
        )));
    }
    Ok(trimmed)
}

/// Derive a research title from its question.
pub fn title_from_question(question: &str) -> String {
    let trimmed = question.trim();
    let first_line = trimmed.lines().next().unwrap_or(trimmed);
    first_line.chars().take(MAX_TITLE_LEN).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
