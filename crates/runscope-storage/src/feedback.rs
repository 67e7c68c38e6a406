//! Feedback repository.

use runscope_core::{now_iso, Feedback, FeedbackPayload, Result, RunscopeError};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::adapter::{Row, SqlValue, StorageAdapter};
use crate::convert::{blob_from_column, parse_datetime, serialize_blob};

const FEEDBACK_COLUMNS: &str =
    "id, trace_id, run_id, feedback_id, score, comment, metadata, created_at";

fn feedback_from_row(row: &Row) -> Result<Feedback> {
    Ok(Feedback {
        id: row.required_text("id")?,
        trace_id: row.text("trace_id"),
        run_id: row.required_text("run_id")?,
        feedback_id: row.text("feedback_id"),
        score: row.float("score"),
        comment: row.text("comment"),
        metadata: blob_from_column(row.text("metadata")),
        created_at: parse_datetime(&row.required_text("created_at")?)?,
    })
}

/// Scores and comments attached to runs.
#[derive(Clone)]
pub struct FeedbackRepository {
    adapter: Arc<dyn StorageAdapter>,
}

impl FeedbackRepository {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    /// Store feedback. When the payload has no trace id, the run's trace id is copied.
    pub async fn create_feedback(&self, payload: &FeedbackPayload) -> Result<Feedback> {
        let adapter = self.adapter.as_ref();
        let trace_id = match &payload.trace_id {
            Some(trace_id) => Some(trace_id.clone()),
            None => {
                let mut params = adapter.params();
                let sql = format!(
                    "SELECT trace_id FROM runs WHERE id = {}",
                    params.push(&payload.run_id)
                );
                adapter
                    .get(&sql, params.values())
                    .await?
                    .and_then(|row| row.text("trace_id"))
            }
        };

        let id = Uuid::new_v4().to_string();
        let metadata = payload.metadata.as_ref().map(serialize_blob).transpose()?;
        let mut params = adapter.params();
        let sql = format!(
            "INSERT INTO feedback ({FEEDBACK_COLUMNS}) VALUES ({})",
            params.push_all([
                SqlValue::from(&id),
                SqlValue::from(trace_id),
                SqlValue::from(&payload.run_id),
                SqlValue::from(payload.feedback_id.as_deref()),
                SqlValue::from(payload.score),
                SqlValue::from(payload.comment.as_deref()),
                SqlValue::from(metadata),
                SqlValue::from(now_iso()),
            ])
        );
        adapter.run(&sql, params.values()).await?;
        debug!(feedback_id = %id, run_id = %payload.run_id, "Feedback stored");

        self.get_feedback(&id)
            .await?
            .ok_or_else(|| RunscopeError::Storage(format!("Feedback '{id}' vanished after insert")))
    }

    pub async fn get_feedback(&self, id: &str) -> Result<Option<Feedback>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!(
            "SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE id = {}",
            params.push(id)
        );
        adapter
            .get(&sql, params.values())
            .await?
            .as_ref()
            .map(feedback_from_row)
            .transpose()
    }

    /// Feedback on one run, oldest first.
    pub async fn get_feedback_by_run(&self, run_id: &str) -> Result<Vec<Feedback>> {
        self.list_by("run_id", run_id).await
    }

    /// Feedback on any run of a trace, oldest first.
    pub async fn get_feedback_by_trace(&self, trace_id: &str) -> Result<Vec<Feedback>> {
        self.list_by("trace_id", trace_id).await
    }

    async fn list_by(&self, column: &str, value: &str) -> Result<Vec<Feedback>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!(
            "SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE {column} = {} ORDER BY created_at ASC",
            params.push(value)
        );
        let rows = adapter.all(&sql, params.values()).await?;
        rows.iter().map(feedback_from_row).collect()
    }

    pub async fn count_feedback_by_trace(&self, trace_id: &str) -> Result<i64> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!(
            "SELECT COUNT(*) AS total FROM feedback WHERE trace_id = {}",
            params.push(trace_id)
        );
        let row = adapter.get(&sql, params.values()).await?;
        Ok(row.and_then(|r| r.int("total")).unwrap_or(0))
    }

    /// Returns whether a row was removed.
    pub async fn delete_feedback(&self, id: &str) -> Result<bool> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!("DELETE FROM feedback WHERE id = {}", params.push(id));
        Ok(adapter.run(&sql, params.values()).await?.changes > 0)
    }
}
