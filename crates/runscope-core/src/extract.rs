//! Derived-field extraction from run payload blobs.
//!
//! `total_tokens`, `model_name`, `time_to_first_token`, `thread_id` and
//! `user_id` are never trusted from the writer when their source blob is
//! present; they are recomputed from `outputs`, `events` and `extra` with the
//! rules below. Extraction never fails: a missing path or malformed blob
//! yields the zero value (`0` or `None`).

use serde_json::Value;
use tracing::warn;

use crate::parse_timestamp_millis;

/// Parse a stored JSON blob. Malformed text is logged and treated as absent.
pub fn parse_blob(column: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(column, error = %e, "Ignoring malformed JSON during derivation");
            None
        }
    }
}

/// Read a JSON number as an integer, truncating floats.
fn as_count(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
}

/// Read a JSON scalar as an identifier string.
fn as_identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Flatten the 2-D `generations` array. Rows that are not arrays are taken
/// as single generations.
fn flatten_generations(generations: &[Value]) -> impl Iterator<Item = &Value> {
    generations.iter().flat_map(|row| match row {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        other => vec![other],
    })
}

/// Total tokens reported in `outputs`.
///
/// `llmOutput.tokenUsage.totalTokens` wins when present; otherwise the
/// `message.kwargs.usage_metadata.total_tokens` of every generation is summed.
pub fn total_tokens_from_outputs(outputs: &Value) -> i64 {
    if let Some(total) = outputs
        .pointer("/llmOutput/tokenUsage/totalTokens")
        .and_then(as_count)
    {
        return total;
    }
    match outputs.get("generations").and_then(Value::as_array) {
        Some(generations) => flatten_generations(generations)
            .filter_map(|g| g.pointer("/message/kwargs/usage_metadata/total_tokens"))
            .filter_map(as_count)
            .sum(),
        None => 0,
    }
}

/// Model name reported by the first generation in `outputs`.
pub fn model_name_from_outputs(outputs: &Value) -> Option<String> {
    let first = outputs
        .get("generations")
        .and_then(Value::as_array)
        .and_then(|generations| flatten_generations(generations).next())?;

    let from_info = ["generationInfo", "generation_info"]
        .iter()
        .filter_map(|key| first.get(*key))
        .find_map(|info| info.get("model_name").and_then(as_identifier));
    if from_info.is_some() {
        return from_info;
    }

    let kwargs = first.pointer("/message/kwargs")?;
    ["response_metadata", "responseMetadata"]
        .iter()
        .filter_map(|key| kwargs.get(*key))
        .find_map(|meta| meta.get("model_name").and_then(as_identifier))
}

/// Epoch milliseconds of one event, read from `time` (or `timestamp`).
fn event_time_millis(event: &Value) -> Option<i64> {
    let raw = event.get("time").or_else(|| event.get("timestamp"))?;
    match raw {
        Value::String(s) => parse_timestamp_millis(s),
        other => as_count(other),
    }
}

/// Milliseconds between the first two events.
///
/// The events are assumed to be in chronological order (start, then first
/// token); they are neither sorted nor validated, so an out-of-order pair
/// yields a negative value.
pub fn time_to_first_token_from_events(events: &Value) -> i64 {
    let Some(events) = events.as_array() else {
        return 0;
    };
    if events.len() < 2 {
        return 0;
    }
    match (event_time_millis(&events[0]), event_time_millis(&events[1])) {
        (Some(first), Some(second)) => second - first,
        _ => 0,
    }
}

/// `extra.metadata.thread_id`.
pub fn thread_id_from_extra(extra: &Value) -> Option<String> {
    extra.pointer("/metadata/thread_id").and_then(as_identifier)
}

/// `extra.metadata.user_id`.
pub fn user_id_from_extra(extra: &Value) -> Option<String> {
    extra.pointer("/metadata/user_id").and_then(as_identifier)
}

/// Whether an error payload denotes a failure.
pub fn error_value_present(error: &Value) -> bool {
    match error {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty() && s != "null",
        _ => true,
    }
}

/// Whether a stored `error` column denotes a failure.
///
/// The column is read back the way [`Run::error`](crate::Run::error) is: JSON when
/// it parses, the raw text as a string otherwise. Both then go through
/// [`error_value_present`].
pub fn error_text_present(raw: Option<&str>) -> bool {
    let Some(raw) = raw else {
        return false;
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => error_value_present(&value),
        Err(_) => error_value_present(&Value::String(raw.to_string())),
    }
}
