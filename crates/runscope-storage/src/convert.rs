//! Conversions between stored column text and domain values.

use chrono::{DateTime, Utc};
use runscope_core::{millis_to_datetime, parse_timestamp_millis, Result, RunTime, RunscopeError};
use serde_json::Value;
use tracing::warn;

/// Parse an ISO timestamp column (`created_at`, `updated_at`).
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    parse_timestamp_millis(s)
        .and_then(millis_to_datetime)
        .ok_or_else(|| RunscopeError::Storage(format!("Invalid datetime '{s}'")))
}

/// Parse an epoch-millisecond string column (`start_time`, `end_time`).
pub(crate) fn parse_millis_column(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref()
        .and_then(parse_timestamp_millis)
        .and_then(millis_to_datetime)
}

/// Normalise a supplied run timestamp to its stored epoch-millisecond form.
pub(crate) fn normalize_run_time(column: &str, time: &RunTime) -> Option<String> {
    match time.to_millis() {
        Some(ms) => Some(ms.to_string()),
        None => {
            warn!(column, value = ?time, "Unparseable run timestamp stored as NULL");
            None
        }
    }
}

/// Serialize a JSON blob column.
pub(crate) fn serialize_blob(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Read a stored JSON blob. Text that is not valid JSON is surfaced as a
/// plain string instead of failing the read.
pub(crate) fn blob_from_column(raw: Option<String>) -> Option<Value> {
    raw.map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Join tags for the `tags` column.
pub(crate) fn join_tags(tags: &[String]) -> String {
    tags.join(",")
}

/// Split the `tags` column.
pub(crate) fn split_tags(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// `Some` only for non-blank strings.
pub(crate) fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.trim().is_empty())
}
