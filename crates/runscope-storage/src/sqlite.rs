//! SQLite storage adapter.
//!
//! Backed by a shared `sqlx` SQLite pool. Placeholders are numbered `?N`
//! tokens and string aggregation maps onto `GROUP_CONCAT`.

use async_trait::async_trait;
use runscope_core::{Result, RunscopeError};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Column, Row as _, Sqlite, SqlitePool, Transaction, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;

use crate::adapter::{
    quote_literal, split_statements, AdapterTransaction, Row, RunResult, SqlValue, StorageAdapter,
};

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Open (or create) a SQLite connection pool configured for Runscope.
pub(crate) async fn open_pool(database_url: &str, max_connections: Option<u32>) -> Result<SqlitePool> {
    let connect_opts = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| RunscopeError::Storage(format!("Invalid database URL: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    // For in-memory databases every connection gets its own database, so
    // restrict the pool to a single connection that is never recycled.
    let in_memory = database_url.contains(":memory:");
    let max_conns = if in_memory {
        1
    } else {
        max_connections.unwrap_or(10)
    };

    let mut pool_opts = sqlx::pool::PoolOptions::<Sqlite>::new().max_connections(max_conns);
    if in_memory {
        pool_opts = pool_opts
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>);
    }

    pool_opts
        .connect_with(connect_opts)
        .await
        .map_err(|e| RunscopeError::Storage(format!("Failed to connect to SQLite: {e}")))
}

fn db_err(e: sqlx::Error) -> RunscopeError {
    RunscopeError::Database(Box::new(e))
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

/// Decode a row by the storage class of each value.
fn decode_row(row: &SqliteRow) -> Result<Row> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx).map_err(db_err)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => SqlValue::Integer(row.try_get::<i64, _>(idx).map_err(db_err)?),
                "REAL" => SqlValue::Real(row.try_get::<f64, _>(idx).map_err(db_err)?),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get(idx).map_err(db_err)?;
                    SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => SqlValue::Text(row.try_get::<String, _>(idx).map_err(db_err)?),
            }
        };
        out.insert(column.name(), value);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// [`StorageAdapter`] over a SQLite database file or an in-memory database.
#[derive(Clone)]
pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    /// Connect to `database_url` (e.g. `sqlite://runscope.db` or `sqlite::memory:`).
    pub async fn connect(database_url: &str, max_connections: Option<u32>) -> Result<Self> {
        let pool = open_pool(database_url, max_connections).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn exec(&self, script: &str) -> Result<()> {
        for statement in split_statements(script) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn run(&self, sql: &str, params: &[SqlValue]) -> Result<RunResult> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(RunResult {
            changes: result.rows_affected(),
        })
    }

    async fn get(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        let row = bind_params(sqlx::query(sql), params)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(decode_row).collect()
    }

    async fn begin(&self) -> Result<Box<dyn AdapterTransaction>> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    fn placeholder(&self, position: usize) -> String {
        format!("?{position}")
    }

    fn string_aggregate(&self, column: &str, distinct: bool, delimiter: &str) -> String {
        // SQLite only allows the default separator together with DISTINCT.
        // Commas inside values are parked on the record separator (0x1E)
        // while the separating commas are swapped for `delimiter`.
        match (distinct, delimiter) {
            (true, ",") => format!("GROUP_CONCAT(DISTINCT {column})"),
            (true, _) => format!(
                "REPLACE(REPLACE(GROUP_CONCAT(DISTINCT REPLACE({column}, ',', char(30))), ',', {}), \
                 char(30), ',')",
                quote_literal(delimiter)
            ),
            (false, _) => format!("GROUP_CONCAT({column}, {})", quote_literal(delimiter)),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// An open SQLite transaction.
struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl AdapterTransaction for SqliteTransaction {
    async fn run(&mut self, sql: &str, params: &[SqlValue]) -> Result<RunResult> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(RunResult {
            changes: result.rows_affected(),
        })
    }

    async fn all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err)?;
        rows.iter().map(decode_row).collect()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::transaction;

    async fn adapter() -> SqliteAdapter {
        let adapter = SqliteAdapter::connect("sqlite::memory:", None).await.unwrap();
        adapter
            .exec("CREATE TABLE items (id TEXT PRIMARY KEY, qty BIGINT, price DOUBLE PRECISION, label TEXT)")
            .await
            .unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_dialect_generators() {
        let pool = SqlitePool::connect_lazy("sqlite::memory:").unwrap();
        let adapter = SqliteAdapter::from_pool(pool);
        assert_eq!(adapter.placeholder(1), "?1");
        assert_eq!(adapter.placeholder(12), "?12");
        assert_eq!(
            adapter.string_aggregate("run_type", true, ","),
            "GROUP_CONCAT(DISTINCT run_type)"
        );
        assert_eq!(
            adapter.string_aggregate("run_type", true, "|"),
            "REPLACE(REPLACE(GROUP_CONCAT(DISTINCT REPLACE(run_type, ',', char(30))), ',', '|'), \
             char(30), ',')"
        );
        assert_eq!(
            adapter.string_aggregate("tags", false, ";"),
            "GROUP_CONCAT(tags, ';')"
        );
    }

    #[tokio::test]
    async fn test_distinct_aggregate_keeps_commas_in_values() {
        let adapter = adapter().await;
        for (id, label) in [("a", "x,y"), ("b", "x,y"), ("c", "z"), ("d", "")] {
            adapter
                .run(
                    "INSERT INTO items (id, label) VALUES (?1, ?2)",
                    &[SqlValue::from(id), SqlValue::from(label)],
                )
                .await
                .unwrap();
        }
        let sql = format!(
            "SELECT {} AS labels FROM items",
            adapter.string_aggregate("label", true, "|")
        );
        let row = adapter.get(&sql, &[]).await.unwrap().unwrap();
        let mut labels = crate::adapter::split_aggregate(row.text("labels"), "|");
        labels.sort();
        assert_eq!(labels, vec!["x,y".to_string(), "z".to_string()]);
    }

    #[tokio::test]
    async fn test_run_get_all_round_trip() {
        let adapter = adapter().await;
        let res = adapter
            .run(
                "INSERT INTO items (id, qty, price, label) VALUES (?1, ?2, ?3, ?4)",
                &[
                    SqlValue::from("a"),
                    SqlValue::Integer(3),
                    SqlValue::Real(1.5),
                    SqlValue::Null,
                ],
            )
            .await
            .unwrap();
        assert_eq!(res.changes, 1);

        let row = adapter
            .get("SELECT * FROM items WHERE id = ?1", &[SqlValue::from("a")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.int("qty"), Some(3));
        assert_eq!(row.float("price"), Some(1.5));
        assert_eq!(row.text("label"), None);

        let missing = adapter
            .get("SELECT * FROM items WHERE id = ?1", &[SqlValue::from("zzz")])
            .await
            .unwrap();
        assert!(missing.is_none());

        let counted = adapter
            .get("SELECT COUNT(*) AS n FROM items", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counted.int("n"), Some(1));
    }

    #[tokio::test]
    async fn test_prepared_statement_reuse() {
        let adapter = adapter().await;
        let dyn_adapter: &dyn StorageAdapter = &adapter;
        let insert = dyn_adapter.prepare("INSERT INTO items (id, qty) VALUES (?1, ?2)");
        for (id, qty) in [("a", 1_i64), ("b", 2), ("c", 3)] {
            insert.run(&[SqlValue::from(id), SqlValue::from(qty)]).await.unwrap();
        }
        let rows = dyn_adapter
            .prepare("SELECT id FROM items ORDER BY qty DESC")
            .all(&[])
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().filter_map(|r| r.text("id")).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_transaction_commits_on_ok() {
        let adapter = adapter().await;
        let inserted = transaction(&adapter, |tx| {
            Box::pin(async move {
                tx.run("INSERT INTO items (id) VALUES (?1)", &[SqlValue::from("x")]).await?;
                tx.run("INSERT INTO items (id) VALUES (?1)", &[SqlValue::from("y")]).await?;
                Ok(2_u32)
            })
        })
        .await
        .unwrap();
        assert_eq!(inserted, 2);

        let row = adapter.get("SELECT COUNT(*) AS n FROM items", &[]).await.unwrap().unwrap();
        assert_eq!(row.int("n"), Some(2));
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_err() {
        let adapter = adapter().await;
        let result: Result<()> = transaction(&adapter, |tx| {
            Box::pin(async move {
                tx.run("INSERT INTO items (id) VALUES (?1)", &[SqlValue::from("x")]).await?;
                // Duplicate primary key aborts the whole unit.
                tx.run("INSERT INTO items (id) VALUES (?1)", &[SqlValue::from("x")]).await?;
                Ok(())
            })
        })
        .await;
        assert!(result.is_err());

        let row = adapter.get("SELECT COUNT(*) AS n FROM items", &[]).await.unwrap().unwrap();
        assert_eq!(row.int("n"), Some(0));
    }

    #[tokio::test]
    async fn test_engine_errors_propagate_unchanged() {
        let adapter = adapter().await;
        let err = adapter.run("INSERT INTO nope (x) VALUES (1)", &[]).await.unwrap_err();
        match err {
            RunscopeError::Database(source) => {
                assert!(source.downcast_ref::<sqlx::Error>().is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exec_multi_statement_and_health() {
        let adapter = adapter().await;
        adapter
            .exec("CREATE TABLE a (x TEXT); CREATE TABLE b (y TEXT);")
            .await
            .unwrap();
        adapter.run("INSERT INTO b (y) VALUES ('ok')", &[]).await.unwrap();
        adapter.health_check().await.unwrap();
        assert_eq!(adapter.backend_name(), "sqlite");
    }
}
