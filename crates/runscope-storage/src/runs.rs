//! Run repository.
//!
//! Runs are the only fact table. Derived columns (`thread_id`, `user_id`,
//! `total_tokens`, `model_name`, `time_to_first_token`) are computed here at
//! write time from the `extra`, `outputs` and `events` blobs using the rules
//! in [`runscope_core::extract`], so every read path can use them directly.

use runscope_core::extract::{
    model_name_from_outputs, parse_blob, thread_id_from_extra, time_to_first_token_from_events,
    total_tokens_from_outputs, user_id_from_extra,
};
use runscope_core::{
    now_iso, FieldKind, Result, Run, RunConditions, RunField, RunPayload, RunTime, RunscopeError,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapter::{
    contains_pattern, transaction, ParamList, Row, SqlValue, StorageAdapter, LIKE_ESCAPE,
};
use crate::convert::{
    blob_from_column, join_tags, non_empty, normalize_run_time, parse_datetime,
    parse_millis_column, serialize_blob, split_tags,
};
use crate::systems::SystemRepository;

/// Page size used when a search does not set a limit.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

pub(crate) const RUN_COLUMNS: &str = "id, trace_id, name, run_type, system, thread_id, user_id, \
     start_time, end_time, inputs, outputs, events, error, extra, serialized, total_tokens, \
     model_name, time_to_first_token, tags, created_at, updated_at";

/// Most recent first; runs without a start time sort last on every engine.
const RECENT_FIRST: &str = "COALESCE(CAST(start_time AS BIGINT), 0) DESC, created_at DESC";

/// Chronological order within a trace or thread.
const CHRONOLOGICAL: &str = "COALESCE(CAST(start_time AS BIGINT), 0) ASC, created_at ASC";

// ---------------------------------------------------------------------------
// Row -> Run conversion
// ---------------------------------------------------------------------------

pub(crate) fn run_from_row(row: &Row) -> Result<Run> {
    Ok(Run {
        id: row.required_text("id")?,
        trace_id: row.text("trace_id"),
        name: row.text("name"),
        run_type: row.text("run_type"),
        system: row.text("system"),
        thread_id: row.text("thread_id"),
        user_id: row.text("user_id"),
        start_time: parse_millis_column(row.text("start_time")),
        end_time: parse_millis_column(row.text("end_time")),
        inputs: blob_from_column(row.text("inputs")),
        outputs: blob_from_column(row.text("outputs")),
        events: blob_from_column(row.text("events")),
        error: blob_from_column(row.text("error")),
        extra: blob_from_column(row.text("extra")),
        serialized: blob_from_column(row.text("serialized")),
        total_tokens: row.int("total_tokens").unwrap_or(0),
        model_name: row.text("model_name"),
        time_to_first_token: row.int("time_to_first_token").unwrap_or(0),
        tags: split_tags(row.text("tags")),
        created_at: parse_datetime(&row.required_text("created_at")?)?,
        updated_at: parse_datetime(&row.required_text("updated_at")?)?,
    })
}

// ---------------------------------------------------------------------------
// Column patches
// ---------------------------------------------------------------------------

/// An ordered set of column assignments. Setting a field twice keeps the
/// last value, so derived values pushed after direct ones win.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct Patch {
    entries: Vec<(RunField, SqlValue)>,
}

impl Patch {
    fn set(&mut self, field: RunField, value: SqlValue) {
        match self.entries.iter_mut().find(|(f, _)| *f == field) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((field, value)),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Columns recomputed whenever `field` is written with `source`.
///
/// `outputs` yields `total_tokens` and `model_name`, `events` yields
/// `time_to_first_token`, and `extra` yields whichever of `thread_id` /
/// `user_id` it carries. Every other field has no derived columns.
pub(crate) fn derived_patches(field: RunField, source: &Value) -> Vec<(RunField, SqlValue)> {
    match field {
        RunField::Outputs => vec![
            (
                RunField::TotalTokens,
                SqlValue::Integer(total_tokens_from_outputs(source)),
            ),
            (
                RunField::ModelName,
                SqlValue::from(model_name_from_outputs(source)),
            ),
        ],
        RunField::Events => vec![(
            RunField::TimeToFirstToken,
            SqlValue::Integer(time_to_first_token_from_events(source)),
        )],
        RunField::Extra => {
            let mut patches = Vec::new();
            if let Some(thread_id) = thread_id_from_extra(source) {
                patches.push((RunField::ThreadId, SqlValue::from(thread_id)));
            }
            if let Some(user_id) = user_id_from_extra(source) {
                patches.push((RunField::UserId, SqlValue::from(user_id)));
            }
            patches
        }
        _ => Vec::new(),
    }
}

/// Column value for a single-field patch.
///
/// `json` only affects blob columns: when false, a string value is stored
/// verbatim instead of being JSON-encoded.
fn field_value(field: RunField, value: &Value, json: bool) -> Result<SqlValue> {
    let converted = match (field.kind(), value) {
        (_, Value::Null) if field.kind() != FieldKind::Integer => SqlValue::Null,
        (FieldKind::Json, Value::String(raw)) if !json => SqlValue::from(raw),
        (FieldKind::Json, other) => SqlValue::from(serialize_blob(other)?),
        (FieldKind::Timestamp, other) => {
            let time: Option<RunTime> = serde_json::from_value(other.clone()).ok();
            SqlValue::from(time.and_then(|t| normalize_run_time(field.column(), &t)))
        }
        (FieldKind::Integer, other) => SqlValue::Integer(
            other
                .as_i64()
                .or_else(|| other.as_f64().map(|f| f.trunc() as i64))
                .or_else(|| other.as_str().and_then(|s| s.trim().parse().ok()))
                .unwrap_or(0),
        ),
        (FieldKind::TagList, Value::Array(items)) => {
            let tags: Vec<String> = items
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect();
            SqlValue::from(join_tags(&tags))
        }
        (_, Value::String(s)) => SqlValue::from(s),
        (_, other) => SqlValue::from(other.to_string()),
    };
    Ok(converted)
}

/// The JSON value derivation should read for a blob-column patch.
fn derivation_source(field: RunField, value: &Value, json: bool) -> Option<Value> {
    match value {
        Value::String(raw) if !json => parse_blob(field.column(), raw),
        Value::Null => None,
        other => Some(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Create, patch and search runs.
#[derive(Clone)]
pub struct RunRepository {
    adapter: Arc<dyn StorageAdapter>,
    systems: SystemRepository,
}

impl RunRepository {
    /// Create a repository over `adapter`. New system names seen on runs are
    /// registered through `systems`.
    pub fn new(adapter: Arc<dyn StorageAdapter>, systems: SystemRepository) -> Self {
        Self { adapter, systems }
    }

    // -- Writes -------------------------------------------------------------

    /// Insert a run, deriving every computed column, and return it as stored.
    pub async fn create_run(&self, payload: &RunPayload) -> Result<Run> {
        let id = payload
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut patch = Patch::default();
        patch.set(RunField::TraceId, SqlValue::from(payload.trace_id.as_deref()));
        patch.set(RunField::Name, SqlValue::from(payload.name.as_deref()));
        patch.set(RunField::RunType, SqlValue::from(payload.run_type.as_deref()));
        patch.set(RunField::System, SqlValue::from(payload.system.as_deref()));

        let extra = payload.extra.as_ref();
        let thread_id = payload
            .thread_id
            .clone()
            .or_else(|| extra.and_then(thread_id_from_extra));
        let user_id = payload
            .user_id
            .clone()
            .or_else(|| extra.and_then(user_id_from_extra));
        patch.set(RunField::ThreadId, SqlValue::from(thread_id));
        patch.set(RunField::UserId, SqlValue::from(user_id));

        patch.set(
            RunField::StartTime,
            SqlValue::from(
                payload
                    .start_time
                    .as_ref()
                    .and_then(|t| normalize_run_time("start_time", t)),
            ),
        );
        patch.set(
            RunField::EndTime,
            SqlValue::from(
                payload
                    .end_time
                    .as_ref()
                    .and_then(|t| normalize_run_time("end_time", t)),
            ),
        );

        for (field, blob) in [
            (RunField::Inputs, &payload.inputs),
            (RunField::Outputs, &payload.outputs),
            (RunField::Events, &payload.events),
            (RunField::Error, &payload.error),
            (RunField::Extra, &payload.extra),
            (RunField::Serialized, &payload.serialized),
        ] {
            let value = blob.as_ref().map(serialize_blob).transpose()?;
            patch.set(field, SqlValue::from(value));
        }

        // Writer-supplied token/model values only fill in what outputs lacks.
        let outputs = payload.outputs.as_ref();
        let derived_tokens = outputs.map(total_tokens_from_outputs).unwrap_or(0);
        let total_tokens = if derived_tokens != 0 {
            derived_tokens
        } else {
            payload.total_tokens.unwrap_or(0)
        };
        let model_name = outputs
            .and_then(model_name_from_outputs)
            .or_else(|| payload.model_name.clone());
        patch.set(RunField::TotalTokens, SqlValue::Integer(total_tokens));
        patch.set(RunField::ModelName, SqlValue::from(model_name));
        patch.set(
            RunField::TimeToFirstToken,
            SqlValue::Integer(
                payload
                    .events
                    .as_ref()
                    .map(time_to_first_token_from_events)
                    .unwrap_or(0),
            ),
        );
        patch.set(
            RunField::Tags,
            SqlValue::from(payload.tags.as_deref().map(join_tags)),
        );

        let system = non_empty(payload.system.as_deref()).map(str::to_string);
        let system_insert = system
            .as_deref()
            .map(|name| self.systems.auto_create_statement(name));

        let adapter = self.adapter.as_ref();
        let now = now_iso();
        let mut params = adapter.params();
        let mut columns = vec!["id"];
        let mut placeholders = vec![params.push(&id)];
        for (field, value) in &patch.entries {
            columns.push(field.column());
            placeholders.push(params.push(value.clone()));
        }
        columns.extend(["created_at", "updated_at"]);
        placeholders.push(params.push(&now));
        placeholders.push(params.push(&now));

        let sql = format!(
            "INSERT INTO runs ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        let values = params.into_values();

        // The system row and the run land together or not at all.
        let system_created = transaction(adapter, move |tx| {
            Box::pin(async move {
                let created = match &system_insert {
                    Some((sql, params)) => tx.run(sql, params).await?.changes > 0,
                    None => false,
                };
                tx.run(&sql, &values).await?;
                Ok(created)
            })
        })
        .await?;
        if system_created {
            info!(system = system.as_deref(), "System auto-created");
        }
        debug!(run_id = %id, total_tokens, "Run created");

        self.get_run(&id)
            .await?
            .ok_or_else(|| RunscopeError::Storage(format!("Run '{id}' vanished after insert")))
    }

    /// Patch the supplied fields of a run. Returns `None` when no run has this id.
    ///
    /// `outputs` always overrides any `total_tokens`/`model_name` in the same
    /// payload; `extra` only fills `thread_id`/`user_id` when they are not
    /// supplied explicitly.
    pub async fn update_run(&self, id: &str, payload: &RunPayload) -> Result<Option<Run>> {
        let mut patch = Patch::default();

        let texts = [
            (RunField::TraceId, &payload.trace_id),
            (RunField::Name, &payload.name),
            (RunField::RunType, &payload.run_type),
            (RunField::System, &payload.system),
            (RunField::ThreadId, &payload.thread_id),
            (RunField::UserId, &payload.user_id),
        ];
        for (field, value) in texts {
            if let Some(value) = value {
                patch.set(field, SqlValue::from(value));
            }
        }
        for (field, time) in [
            (RunField::StartTime, &payload.start_time),
            (RunField::EndTime, &payload.end_time),
        ] {
            if let Some(time) = time {
                patch.set(field, SqlValue::from(normalize_run_time(field.column(), time)));
            }
        }
        if let Some(tokens) = payload.total_tokens {
            patch.set(RunField::TotalTokens, SqlValue::Integer(tokens));
        }
        if let Some(model) = &payload.model_name {
            patch.set(RunField::ModelName, SqlValue::from(model));
        }
        if let Some(tags) = &payload.tags {
            patch.set(RunField::Tags, SqlValue::from(join_tags(tags)));
        }

        for (field, blob) in [
            (RunField::Inputs, &payload.inputs),
            (RunField::Outputs, &payload.outputs),
            (RunField::Events, &payload.events),
            (RunField::Error, &payload.error),
            (RunField::Extra, &payload.extra),
            (RunField::Serialized, &payload.serialized),
        ] {
            let Some(blob) = blob else { continue };
            patch.set(field, SqlValue::from(serialize_blob(blob)?));
            for (derived, value) in derived_patches(field, blob) {
                let explicit = match derived {
                    RunField::ThreadId => payload.thread_id.is_some(),
                    RunField::UserId => payload.user_id.is_some(),
                    _ => false,
                };
                if !explicit {
                    patch.set(derived, value);
                }
            }
        }

        let system = non_empty(payload.system.as_deref()).map(str::to_string);
        let system_insert = system
            .as_deref()
            .map(|name| self.systems.auto_create_statement(name));

        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let mut sets: Vec<String> = patch
            .entries
            .iter()
            .map(|(field, value)| format!("{} = {}", field.column(), params.push(value.clone())))
            .collect();
        sets.push(format!("updated_at = {}", params.push(now_iso())));
        let sql = format!(
            "UPDATE runs SET {} WHERE id = {}",
            sets.join(", "),
            params.push(id)
        );
        let values = params.into_values();

        let (found, system_created) = transaction(adapter, move |tx| {
            Box::pin(async move {
                if tx.run(&sql, &values).await?.changes == 0 {
                    return Ok((false, false));
                }
                let created = match &system_insert {
                    Some((sql, params)) => tx.run(sql, params).await?.changes > 0,
                    None => false,
                };
                Ok((true, created))
            })
        })
        .await?;
        if !found {
            return Ok(None);
        }
        if system_created {
            info!(system = system.as_deref(), "System auto-created");
        }
        debug!(run_id = id, fields = patch.len(), "Run updated");
        self.get_run(id).await
    }

    /// Patch one column of a run and any columns derived from it.
    ///
    /// The primary write and its derived writes run as separate `UPDATE`
    /// statements inside one transaction. Returns `None` when no run has this id.
    pub async fn update_run_field(
        &self,
        id: &str,
        field: RunField,
        value: &Value,
        json: bool,
    ) -> Result<Option<Run>> {
        let mut writes = vec![(field, field_value(field, value, json)?)];
        if field.kind() == FieldKind::Json {
            match derivation_source(field, value, json) {
                Some(source) => writes.extend(derived_patches(field, &source)),
                // A cleared or unreadable blob resets what was derived from it.
                None => writes.extend(derived_patches(field, &Value::Null)),
            }
        }

        let system_insert = match (field, &writes[0].1) {
            (RunField::System, SqlValue::Text(system)) if !system.trim().is_empty() => {
                Some(self.systems.auto_create_statement(system))
            }
            _ => None,
        };

        let adapter = self.adapter.as_ref();
        let now = now_iso();
        let statements: Vec<(String, Vec<SqlValue>)> = writes
            .iter()
            .map(|(column, value)| {
                let mut params = ParamList::new(adapter);
                let sql = format!(
                    "UPDATE runs SET {} = {}, updated_at = {} WHERE id = {}",
                    column.column(),
                    params.push(value.clone()),
                    params.push(&now),
                    params.push(id)
                );
                (sql, params.into_values())
            })
            .collect();
        let physical = statements.len();

        let found = transaction(adapter, move |tx| {
            Box::pin(async move {
                for (index, (sql, params)) in statements.iter().enumerate() {
                    let result = tx.run(sql, params).await?;
                    if index == 0 && result.changes == 0 {
                        return Ok(false);
                    }
                }
                if let Some((sql, params)) = &system_insert {
                    tx.run(sql, params).await?;
                }
                Ok(true)
            })
        })
        .await?;

        if !found {
            return Ok(None);
        }
        debug!(run_id = id, field = %field, physical, "Run field patched");
        self.get_run(id).await
    }

    // -- Point reads --------------------------------------------------------

    /// Look up one run.
    pub async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = {}", params.push(id));
        adapter
            .get(&sql, params.values())
            .await?
            .as_ref()
            .map(run_from_row)
            .transpose()
    }

    /// Every run of a trace, in start order.
    pub async fn get_runs_by_trace(&self, trace_id: &str) -> Result<Vec<Run>> {
        self.list_ordered("trace_id", trace_id).await
    }

    /// Every run of a thread, in start order.
    pub async fn get_runs_by_thread(&self, thread_id: &str) -> Result<Vec<Run>> {
        self.list_ordered("thread_id", thread_id).await
    }

    async fn list_ordered(&self, column: &str, value: &str) -> Result<Vec<Run>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE {column} = {} ORDER BY {CHRONOLOGICAL}",
            params.push(value)
        );
        let rows = adapter.all(&sql, params.values()).await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Runs reported under a system, most recent first.
    pub async fn get_runs_by_system(&self, system: &str, limit: u32, offset: u32) -> Result<Vec<Run>> {
        let conditions = RunConditions::new()
            .with_system(system)
            .with_limit(limit)
            .with_offset(offset);
        self.search_runs(&conditions).await
    }

    /// Runs of one user, most recent first.
    pub async fn get_runs_by_user(&self, user_id: &str, limit: u32, offset: u32) -> Result<Vec<Run>> {
        let conditions = RunConditions {
            user_id: Some(user_id.to_string()),
            ..RunConditions::new()
        }
        .with_limit(limit)
        .with_offset(offset);
        self.search_runs(&conditions).await
    }

    /// Runs of one type, most recent first.
    pub async fn get_runs_by_run_type(&self, run_type: &str, limit: u32, offset: u32) -> Result<Vec<Run>> {
        let conditions = RunConditions::new()
            .with_run_type(run_type)
            .with_limit(limit)
            .with_offset(offset);
        self.search_runs(&conditions).await
    }

    // -- Search -------------------------------------------------------------

    /// Runs matching every present condition, most recent first.
    pub async fn search_runs(&self, conditions: &RunConditions) -> Result<Vec<Run>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let where_clause = where_clause(&run_condition_clauses(&mut params, conditions));
        let limit = params.push(conditions.limit.unwrap_or(DEFAULT_PAGE_SIZE));
        let offset = params.push(conditions.offset.unwrap_or(0));
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs{where_clause} ORDER BY {RECENT_FIRST} LIMIT {limit} OFFSET {offset}"
        );
        let rows = adapter.all(&sql, params.values()).await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Number of runs matching every present condition; limit and offset are ignored.
    pub async fn count_runs(&self, conditions: &RunConditions) -> Result<i64> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let where_clause = where_clause(&run_condition_clauses(&mut params, conditions));
        let sql = format!("SELECT COUNT(*) AS total FROM runs{where_clause}");
        let row = adapter.get(&sql, params.values()).await?;
        Ok(row.and_then(|r| r.int("total")).unwrap_or(0))
    }

    /// Number of runs reported under a system.
    pub async fn count_runs_by_system(&self, system: &str) -> Result<i64> {
        self.count_runs(&RunConditions::new().with_system(system)).await
    }

    /// Number of runs of one type.
    pub async fn count_runs_by_run_type(&self, run_type: &str) -> Result<i64> {
        self.count_runs(&RunConditions::new().with_run_type(run_type)).await
    }

    /// Distinct non-empty run types, sorted.
    pub async fn list_run_types(&self) -> Result<Vec<String>> {
        self.distinct_values("run_type").await
    }

    /// Distinct non-empty model names, sorted.
    pub async fn list_model_names(&self) -> Result<Vec<String>> {
        self.distinct_values("model_name").await
    }

    async fn distinct_values(&self, column: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT {column} AS value FROM runs
             WHERE {column} IS NOT NULL AND {column} <> '' ORDER BY {column}"
        );
        let rows = self.adapter.all(&sql, &[]).await?;
        Ok(rows.iter().filter_map(|r| r.text("value")).collect())
    }
}

// ---------------------------------------------------------------------------
// Condition building
// ---------------------------------------------------------------------------

/// SQL predicates for every present run condition, binding into `params`.
pub(crate) fn run_condition_clauses(params: &mut ParamList<'_>, c: &RunConditions) -> Vec<String> {
    let mut clauses = Vec::new();
    let exact = [
        ("run_type", &c.run_type),
        ("system", &c.system),
        ("model_name", &c.model_name),
        ("thread_id", &c.thread_id),
        ("user_id", &c.user_id),
        ("trace_id", &c.trace_id),
    ];
    for (column, value) in exact {
        if let Some(value) = value {
            clauses.push(format!("{column} = {}", params.push(value)));
        }
    }
    if let Some(tag) = &c.tag {
        clauses.push(format!(
            "tags LIKE {} {LIKE_ESCAPE}",
            params.push(contains_pattern(tag))
        ));
    }
    if let Some(after) = c.start_time_after {
        clauses.push(format!(
            "CAST(start_time AS BIGINT) >= {}",
            params.push(after.timestamp_millis())
        ));
    }
    if let Some(before) = c.start_time_before {
        clauses.push(format!(
            "CAST(start_time AS BIGINT) <= {}",
            params.push(before.timestamp_millis())
        ));
    }
    clauses
}

/// ` WHERE a AND b`, or nothing for an empty clause list.
pub(crate) fn where_clause(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::initialize_schema;
    use crate::sqlite::SqliteAdapter;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    async fn repo() -> RunRepository {
        let adapter: Arc<dyn StorageAdapter> =
            Arc::new(SqliteAdapter::connect("sqlite::memory:", None).await.unwrap());
        initialize_schema(adapter.as_ref()).await.unwrap();
        RunRepository::new(adapter.clone(), SystemRepository::new(adapter))
    }

    fn llm_outputs(tokens: i64, model: &str) -> Value {
        json!({
            "generations": [[{
                "generationInfo": {"model_name": model},
                "message": {"kwargs": {"usage_metadata": {"total_tokens": tokens}}}
            }]]
        })
    }

    fn payload(run_type: &str, system: &str, start: &str) -> RunPayload {
        RunPayload {
            run_type: Some(run_type.to_string()),
            system: Some(system.to_string()),
            start_time: Some(RunTime::from(start)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_run_generates_id_and_derives_fields() {
        let repo = repo().await;
        let run = repo
            .create_run(&RunPayload {
                name: Some("ChatOpenAI".to_string()),
                run_type: Some("llm".to_string()),
                start_time: Some(RunTime::from("2024-01-01T00:10:00Z")),
                end_time: Some(RunTime::Millis(1_704_067_802_000)),
                outputs: Some(llm_outputs(120, "gpt-4")),
                events: Some(json!([{"time": 1000}, {"time": 1400}])),
                extra: Some(json!({"metadata": {"thread_id": "th-1", "user_id": "u-1"}})),
                tags: Some(vec!["prod".to_string(), "beta".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(Uuid::parse_str(&run.id).is_ok());
        assert_eq!(run.total_tokens, 120);
        assert_eq!(run.model_name.as_deref(), Some("gpt-4"));
        assert_eq!(run.time_to_first_token, 400);
        assert_eq!(run.thread_id.as_deref(), Some("th-1"));
        assert_eq!(run.user_id.as_deref(), Some("u-1"));
        assert_eq!(run.duration_ms(), Some(2_000));
        assert_eq!(run.tags, vec!["prod".to_string(), "beta".to_string()]);
    }

    #[tokio::test]
    async fn test_create_run_with_nothing_but_defaults() {
        let repo = repo().await;
        let run = repo.create_run(&RunPayload::default()).await.unwrap();
        assert_eq!(run.total_tokens, 0);
        assert_eq!(run.time_to_first_token, 0);
        assert!(run.model_name.is_none());
        assert!(run.thread_id.is_none());
        assert!(run.start_time.is_none());
        assert!(run.tags.is_empty());
    }

    #[tokio::test]
    async fn test_create_run_explicit_ids_beat_extra() {
        let repo = repo().await;
        let run = repo
            .create_run(&RunPayload {
                id: Some("run-1".to_string()),
                thread_id: Some("explicit".to_string()),
                extra: Some(json!({"metadata": {"thread_id": "from-extra", "user_id": "u"}})),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(run.id, "run-1");
        assert_eq!(run.thread_id.as_deref(), Some("explicit"));
        assert_eq!(run.user_id.as_deref(), Some("u"));
    }

    #[tokio::test]
    async fn test_create_run_supplied_tokens_only_fill_gaps() {
        let repo = repo().await;
        let with_outputs = repo
            .create_run(&RunPayload {
                outputs: Some(llm_outputs(50, "gpt-4")),
                total_tokens: Some(999),
                model_name: Some("other".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(with_outputs.total_tokens, 50);
        assert_eq!(with_outputs.model_name.as_deref(), Some("gpt-4"));

        let without_outputs = repo
            .create_run(&RunPayload {
                total_tokens: Some(10),
                model_name: Some("claude".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(without_outputs.total_tokens, 10);
        assert_eq!(without_outputs.model_name.as_deref(), Some("claude"));
    }

    #[tokio::test]
    async fn test_create_run_registers_system() {
        let repo = repo().await;
        repo.create_run(&payload("llm", "acme", "1000")).await.unwrap();
        repo.create_run(&payload("llm", "", "1000")).await.unwrap();
        let systems = repo.systems.list_systems().await.unwrap();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].name, "acme");
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_no_system_behind() {
        let repo = repo().await;
        repo.create_run(&RunPayload {
            id: Some("dup".to_string()),
            ..payload("llm", "acme", "1000")
        })
        .await
        .unwrap();

        let duplicate = repo
            .create_run(&RunPayload {
                id: Some("dup".to_string()),
                ..payload("llm", "newco", "1000")
            })
            .await;
        assert!(duplicate.is_err());
        assert!(repo.systems.get_system_by_name("newco").await.unwrap().is_none());
        assert_eq!(repo.systems.list_systems().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_registers_system_only_for_existing_runs() {
        let repo = repo().await;
        let missing = RunPayload {
            system: Some("ghost".to_string()),
            ..Default::default()
        };
        assert!(repo.update_run("nope", &missing).await.unwrap().is_none());
        assert!(repo.systems.get_system_by_name("ghost").await.unwrap().is_none());

        let run = repo.create_run(&RunPayload::default()).await.unwrap();
        let moved = RunPayload {
            system: Some("newco".to_string()),
            ..Default::default()
        };
        let updated = repo.update_run(&run.id, &moved).await.unwrap().unwrap();
        assert_eq!(updated.system.as_deref(), Some("newco"));
        assert!(repo.systems.get_system_by_name("newco").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_blob_round_trip() {
        let repo = repo().await;
        let inputs = json!({"messages": [{"role": "user", "content": "hi"}], "n": 1.5, "ok": true});
        let created = repo
            .create_run(&RunPayload {
                inputs: Some(inputs.clone()),
                error: Some(json!("boom")),
                ..Default::default()
            })
            .await
            .unwrap();
        let read = repo.get_run(&created.id).await.unwrap().unwrap();
        assert_eq!(read.inputs, Some(inputs));
        assert_eq!(read.error, Some(json!("boom")));
        assert!(read.is_failed());
    }

    #[tokio::test]
    async fn test_update_run_outputs_override_supplied_tokens() {
        let repo = repo().await;
        let run = repo.create_run(&RunPayload::default()).await.unwrap();
        let updated = repo
            .update_run(
                &run.id,
                &RunPayload {
                    outputs: Some(llm_outputs(77, "gpt-4o")),
                    total_tokens: Some(1),
                    model_name: Some("ignored".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.total_tokens, 77);
        assert_eq!(updated.model_name.as_deref(), Some("gpt-4o"));
    }

    #[tokio::test]
    async fn test_update_run_touches_only_supplied_fields() {
        let repo = repo().await;
        let run = repo
            .create_run(&RunPayload {
                name: Some("chain".to_string()),
                extra: Some(json!({"metadata": {"thread_id": "t1", "user_id": "u1"}})),
                ..Default::default()
            })
            .await
            .unwrap();

        let updated = repo
            .update_run(
                &run.id,
                &RunPayload {
                    end_time: Some(RunTime::Millis(5_000)),
                    events: Some(json!([{"time": 100}, {"time": 130}])),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name.as_deref(), Some("chain"));
        assert_eq!(updated.thread_id.as_deref(), Some("t1"));
        assert_eq!(updated.time_to_first_token, 30);
        assert_eq!(updated.end_time.map(|t| t.timestamp_millis()), Some(5_000));
    }

    #[tokio::test]
    async fn test_update_run_rederives_ids_from_extra() {
        let repo = repo().await;
        let run = repo.create_run(&RunPayload::default()).await.unwrap();
        let updated = repo
            .update_run(
                &run.id,
                &RunPayload {
                    user_id: Some("explicit-user".to_string()),
                    extra: Some(json!({"metadata": {"thread_id": "t9", "user_id": "u9"}})),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.thread_id.as_deref(), Some("t9"));
        assert_eq!(updated.user_id.as_deref(), Some("explicit-user"));
    }

    #[tokio::test]
    async fn test_update_missing_run_returns_none() {
        let repo = repo().await;
        let patch = RunPayload {
            name: Some("x".to_string()),
            ..Default::default()
        };
        assert!(repo.update_run("missing", &patch).await.unwrap().is_none());
        let res = repo
            .update_run_field("missing", RunField::Outputs, &llm_outputs(1, "m"), true)
            .await
            .unwrap();
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn test_update_run_field_cascades() {
        let repo = repo().await;
        let run = repo.create_run(&RunPayload::default()).await.unwrap();

        let after_outputs = repo
            .update_run_field(&run.id, RunField::Outputs, &llm_outputs(64, "mistral"), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_outputs.total_tokens, 64);
        assert_eq!(after_outputs.model_name.as_deref(), Some("mistral"));

        let after_extra = repo
            .update_run_field(
                &run.id,
                RunField::Extra,
                &json!({"metadata": {"thread_id": "th"}}),
                true,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_extra.thread_id.as_deref(), Some("th"));
        assert!(after_extra.user_id.is_none());

        let after_name = repo
            .update_run_field(&run.id, RunField::Name, &json!("renamed"), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_name.name.as_deref(), Some("renamed"));
        assert_eq!(after_name.total_tokens, 64);
    }

    #[tokio::test]
    async fn test_update_run_field_raw_json_text() {
        let repo = repo().await;
        let run = repo.create_run(&RunPayload::default()).await.unwrap();
        let raw = llm_outputs(9, "gpt-4").to_string();
        let updated = repo
            .update_run_field(&run.id, RunField::Outputs, &Value::String(raw), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.total_tokens, 9);
        assert_eq!(updated.outputs, Some(llm_outputs(9, "gpt-4")));
    }

    #[test]
    fn test_derived_patches() {
        let outputs = derived_patches(RunField::Outputs, &llm_outputs(3, "m"));
        assert_eq!(
            outputs,
            vec![
                (RunField::TotalTokens, SqlValue::Integer(3)),
                (RunField::ModelName, SqlValue::from("m")),
            ]
        );
        assert!(derived_patches(RunField::Extra, &json!({})).is_empty());
        assert!(derived_patches(RunField::Name, &json!("x")).is_empty());
    }

    #[test]
    fn test_patch_last_write_wins() {
        let mut patch = Patch::default();
        patch.set(RunField::TotalTokens, SqlValue::Integer(1));
        patch.set(RunField::Name, SqlValue::from("n"));
        patch.set(RunField::TotalTokens, SqlValue::Integer(2));
        assert_eq!(patch.len(), 2);
        assert_eq!(
            patch.entries,
            vec![
                (RunField::TotalTokens, SqlValue::Integer(2)),
                (RunField::Name, SqlValue::from("n")),
            ]
        );
    }

    #[tokio::test]
    async fn test_search_and_count() {
        let repo = repo().await;
        repo.create_run(&RunPayload {
            tags: Some(vec!["prod".to_string()]),
            outputs: Some(llm_outputs(1, "gpt-4")),
            ..payload("llm", "acme", "2024-01-01T00:00:00Z")
        })
        .await
        .unwrap();
        repo.create_run(&payload("chain", "acme", "2024-01-01T01:00:00Z"))
            .await
            .unwrap();
        repo.create_run(&payload("llm", "other", "2024-01-01T02:00:00Z"))
            .await
            .unwrap();

        let all = repo.search_runs(&RunConditions::new()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].system.as_deref(), Some("other"));

        let acme_llm = RunConditions::new().with_system("acme").with_run_type("llm");
        assert_eq!(repo.search_runs(&acme_llm).await.unwrap().len(), 1);
        assert_eq!(repo.count_runs(&acme_llm).await.unwrap(), 1);

        let tagged = RunConditions::new().with_tag("pro");
        assert_eq!(repo.count_runs(&tagged).await.unwrap(), 1);

        // `_` and `%` in a tag filter match themselves only.
        let wildcard = RunConditions::new().with_tag("p_od");
        assert_eq!(repo.count_runs(&wildcard).await.unwrap(), 0);
        let percent = RunConditions::new().with_tag("%");
        assert_eq!(repo.count_runs(&percent).await.unwrap(), 0);

        let by_model = RunConditions::new().with_model("gpt-4");
        assert_eq!(repo.count_runs(&by_model).await.unwrap(), 1);

        let window = RunConditions::new().with_time_range(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap(),
        );
        assert_eq!(repo.count_runs(&window).await.unwrap(), 2);

        let page = RunConditions::new().with_limit(2).with_offset(2);
        assert_eq!(repo.search_runs(&page).await.unwrap().len(), 1);
        assert_eq!(repo.count_runs(&page).await.unwrap(), 3);

        assert_eq!(repo.count_runs_by_system("acme").await.unwrap(), 2);
        assert_eq!(repo.count_runs_by_run_type("llm").await.unwrap(), 2);
        assert_eq!(repo.get_runs_by_system("acme", 10, 0).await.unwrap().len(), 2);
        assert_eq!(repo.get_runs_by_run_type("chain", 10, 0).await.unwrap().len(), 1);
        assert_eq!(repo.list_run_types().await.unwrap(), vec!["chain", "llm"]);
        assert_eq!(repo.list_model_names().await.unwrap(), vec!["gpt-4"]);
    }

    #[tokio::test]
    async fn test_trace_thread_and_user_lookups() {
        let repo = repo().await;
        for (id, start) in [("b", "2000"), ("a", "1000")] {
            repo.create_run(&RunPayload {
                id: Some(id.to_string()),
                trace_id: Some("tr".to_string()),
                thread_id: Some("th".to_string()),
                user_id: Some("u".to_string()),
                start_time: Some(RunTime::from(start)),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let trace: Vec<_> = repo
            .get_runs_by_trace("tr")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(trace, vec!["a", "b"]);
        assert_eq!(repo.get_runs_by_thread("th").await.unwrap().len(), 2);
        assert_eq!(repo.get_runs_by_user("u", 1, 0).await.unwrap().len(), 1);
        assert!(repo.get_runs_by_trace("none").await.unwrap().is_empty());
    }
}
