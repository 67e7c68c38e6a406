//! Schema initialisation.
//!
//! Creates the four entity tables, the hourly rollup table and the indexes on
//! the most-filtered run columns. Every statement is `IF NOT EXISTS`, so the
//! initializer can run on every startup.

use runscope_core::Result;
use tracing::info;

use crate::adapter::{split_statements, StorageAdapter};

/// Entity tables.
pub const TABLES_SQL: &str = "
CREATE TABLE IF NOT EXISTS systems (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    api_key TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    trace_id TEXT,
    name TEXT,
    run_type TEXT,
    system TEXT,
    thread_id TEXT,
    user_id TEXT,
    start_time TEXT,
    end_time TEXT,
    inputs TEXT,
    outputs TEXT,
    events TEXT,
    error TEXT,
    extra TEXT,
    serialized TEXT,
    total_tokens BIGINT NOT NULL DEFAULT 0,
    model_name TEXT,
    time_to_first_token BIGINT NOT NULL DEFAULT 0,
    tags TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feedback (
    id TEXT PRIMARY KEY,
    trace_id TEXT,
    run_id TEXT NOT NULL,
    feedback_id TEXT,
    score DOUBLE PRECISION,
    comment TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    content_type TEXT,
    file_size BIGINT NOT NULL DEFAULT 0,
    storage_path TEXT NOT NULL,
    created_at TEXT NOT NULL
)";

/// Hourly rollup table. `system` uses `''` for the null dimension so the
/// unique triple conflicts on upsert.
pub const ROLLUP_SQL: &str = "
CREATE TABLE IF NOT EXISTS run_stats_hourly (
    stat_hour BIGINT NOT NULL,
    model_name TEXT NOT NULL,
    system TEXT NOT NULL DEFAULT '',
    total_runs BIGINT NOT NULL DEFAULT 0,
    successful_runs BIGINT NOT NULL DEFAULT 0,
    failed_runs BIGINT NOT NULL DEFAULT 0,
    error_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
    total_duration_ms BIGINT NOT NULL DEFAULT 0,
    avg_duration_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
    p95_duration_ms BIGINT NOT NULL DEFAULT 0,
    p99_duration_ms BIGINT NOT NULL DEFAULT 0,
    total_tokens_sum BIGINT NOT NULL DEFAULT 0,
    avg_tokens_per_run DOUBLE PRECISION NOT NULL DEFAULT 0,
    avg_ttft_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
    p95_ttft_ms BIGINT NOT NULL DEFAULT 0,
    distinct_users BIGINT NOT NULL DEFAULT 0,
    UNIQUE (stat_hour, model_name, system)
)";

/// Indexes on the most-filtered columns.
pub const INDEXES_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_runs_trace_id ON runs(trace_id);
CREATE INDEX IF NOT EXISTS idx_runs_thread_id ON runs(thread_id);
CREATE INDEX IF NOT EXISTS idx_runs_user_id ON runs(user_id);
CREATE INDEX IF NOT EXISTS idx_runs_model_name ON runs(model_name);
CREATE INDEX IF NOT EXISTS idx_runs_system ON runs(system);
CREATE INDEX IF NOT EXISTS idx_runs_run_type ON runs(run_type);
CREATE INDEX IF NOT EXISTS idx_feedback_run_id ON feedback(run_id);
CREATE INDEX IF NOT EXISTS idx_feedback_trace_id ON feedback(trace_id);
CREATE INDEX IF NOT EXISTS idx_attachments_run_id ON attachments(run_id);
CREATE INDEX IF NOT EXISTS idx_run_stats_hourly_hour ON run_stats_hourly(stat_hour)
";

/// Create every table and index that does not exist yet.
pub async fn initialize_schema(adapter: &dyn StorageAdapter) -> Result<()> {
    let mut applied = 0;
    for script in [TABLES_SQL, ROLLUP_SQL, INDEXES_SQL] {
        adapter.exec(script).await?;
        applied += split_statements(script).count();
    }
    info!(
        backend = adapter.backend_name(),
        statements = applied,
        "Schema initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SqlValue;
    use crate::sqlite::SqliteAdapter;

    #[tokio::test]
    async fn test_initialize_creates_all_tables() {
        let adapter = SqliteAdapter::connect("sqlite::memory:", None).await.unwrap();
        initialize_schema(&adapter).await.unwrap();

        let rows = adapter
            .all(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                &[],
            )
            .await
            .unwrap();
        let names: Vec<_> = rows.iter().filter_map(|r| r.text("name")).collect();
        for table in ["attachments", "feedback", "run_stats_hourly", "runs", "systems"] {
            assert!(names.iter().any(|n| n == table), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let adapter = SqliteAdapter::connect("sqlite::memory:", None).await.unwrap();
        initialize_schema(&adapter).await.unwrap();
        initialize_schema(&adapter).await.unwrap();

        let idx = adapter
            .get(
                "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_runs_%'",
                &[],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(idx.int("n"), Some(6));
    }

    #[tokio::test]
    async fn test_rollup_triple_is_unique() {
        let adapter = SqliteAdapter::connect("sqlite::memory:", None).await.unwrap();
        initialize_schema(&adapter).await.unwrap();

        let insert = "INSERT INTO run_stats_hourly (stat_hour, model_name, system) VALUES (?1, ?2, ?3)";
        let params = [SqlValue::Integer(0), SqlValue::from("gpt-4"), SqlValue::from("")];
        adapter.run(insert, &params).await.unwrap();
        assert!(adapter.run(insert, &params).await.is_err());
    }
}
