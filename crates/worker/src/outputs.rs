//! Extraction of structured step outputs.
//!
//! Workflow steps report outputs as a free-form JSON object. Array and
//! object outputs may arrive either as JSON values or as JSON encoded in a
//! string; both forms are accepted.

use quarry_core::research::{RelatedItem, Source};
use serde_json::{Map, Value};

/// Output keys that may carry the final report, in priority order.
const STEP_CONTENT_KEYS: [&str; 2] = ["research_content", "content"];

/// Output keys checked on `workflow_finished`, in priority order.
const WORKFLOW_CONTENT_KEYS: [&str; 3] = ["research_content", "content", "answer"];

/// Structured outputs of one finished step.
#[derive(Debug, Default, PartialEq)]
pub struct StepOutputs {
    pub content: Option<String>,
    pub chart: Option<Map<String, Value>>,
    pub sources: Vec<Source>,
    pub related: Vec<RelatedItem>,
}

/// Extract everything the worker uses from a step's `outputs`.
pub fn extract(outputs: &Value) -> StepOutputs {
    StepOutputs {
        content: first_text(outputs, &STEP_CONTENT_KEYS),
        chart: embedded(outputs, "chart_data").and_then(|v| match v {
            Value::Object(map) if !map.is_empty() => Some(map),
            _ => None,
        }),
        sources: embedded_array(outputs, "sources")
            .map(|items| format_sources(&items))
            .unwrap_or_default(),
        related: embedded_array(outputs, "related")
            .map(|items| format_related(&items))
            .unwrap_or_default(),
    }
}

/// Final report carried by the `workflow_finished` outputs, if any.
pub fn workflow_content(outputs: &Value) -> Option<String> {
    first_text(outputs, &WORKFLOW_CONTENT_KEYS)
}

/// Normalize raw source objects, filling missing fields by position.
pub fn format_sources(items: &[Value]) -> Vec<Source> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let n = i + 1;
            Source {
                id: text(item, "id").unwrap_or_else(|| n.to_string()),
                source_id: text(item, "sourceId")
                    .or_else(|| text(item, "source_id"))
                    .unwrap_or_else(|| format!("source-{n}")),
                title: text(item, "title").unwrap_or_else(|| format!("Source {n}")),
                url: text(item, "url").unwrap_or_else(|| "#".into()),
                source: text(item, "source").unwrap_or_else(|| "Unknown".into()),
            }
        })
        .collect()
}

/// Normalize raw related-item objects, filling missing fields by position.
pub fn format_related(items: &[Value]) -> Vec<RelatedItem> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let n = i + 1;
            RelatedItem {
                id: text(item, "id").unwrap_or_else(|| n.to_string()),
                title: text(item, "title").unwrap_or_else(|| format!("Related {n}")),
                url: text(item, "url").unwrap_or_else(|| "#".into()),
                date: text(item, "date"),
                description: text(item, "description").or_else(|| text(item, "summary")),
            }
        })
        .collect()
}

fn first_text(outputs: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        outputs
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    })
}

/// A non-empty string field, or a number rendered as text.
fn text(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The value at `key`, decoding it first when it is a JSON string.
fn embedded(outputs: &Value, key: &str) -> Option<Value> {
    match outputs.get(key)? {
        Value::Null => None,
        Value::String(raw) if raw.trim().is_empty() => None,
        Value::String(raw) => match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(output = key, error = %e, "Ignoring undecodable step output");
                None
            }
        },
        other => Some(other.clone()),
    }
}

fn embedded_array(outputs: &Value, key: &str) -> Option<Vec<Value>> {
    match embedded(outputs, key)? {
        Value::Array(items) => Some(items),
        _ => None,
    }
}
