//! The storage adapter contract.
//!
//! Repositories talk to the database only through [`StorageAdapter`]. SQL
//! text is assembled from portable SQL plus the two dialect generators the
//! adapter exposes, [`StorageAdapter::placeholder`] and
//! [`StorageAdapter::string_aggregate`]; no repository ever branches on the
//! engine. Values cross the seam as [`SqlValue`] and rows come back as
//! column-keyed [`Row`]s.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use runscope_core::{Result, RunscopeError};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Values and rows
// ---------------------------------------------------------------------------

/// A bound parameter or a decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Whether the value is SQL `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// One result row, keyed by column name (or alias).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: HashMap<String, SqlValue>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column value.
    pub fn insert(&mut self, column: impl Into<String>, value: SqlValue) {
        self.columns.insert(column.into(), value);
    }

    /// Column as text. Numbers are rendered; `NULL` and missing columns are `None`.
    pub fn text(&self, column: &str) -> Option<String> {
        match self.columns.get(column)? {
            SqlValue::Null => None,
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Integer(v) => Some(v.to_string()),
            SqlValue::Real(v) => Some(v.to_string()),
        }
    }

    /// Column as a required text value.
    pub fn required_text(&self, column: &str) -> Result<String> {
        self.text(column)
            .ok_or_else(|| RunscopeError::Storage(format!("Column '{column}' is NULL or missing")))
    }

    /// Column as an integer. Reals are truncated and numeric text is parsed.
    pub fn int(&self, column: &str) -> Option<i64> {
        match self.columns.get(column)? {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Real(v) => Some(v.trunc() as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }

    /// Column as a float.
    pub fn float(&self, column: &str) -> Option<f64> {
        match self.columns.get(column)? {
            SqlValue::Integer(v) => Some(*v as f64),
            SqlValue::Real(v) => Some(*v),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunResult {
    /// Rows inserted, updated, or deleted.
    pub changes: u64,
}

// ---------------------------------------------------------------------------
// Adapter traits
// ---------------------------------------------------------------------------

/// An open transaction obtained from [`StorageAdapter::begin`].
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait AdapterTransaction: Send {
    /// Execute a write statement inside the transaction.
    async fn run(&mut self, sql: &str, params: &[SqlValue]) -> Result<RunResult>;

    /// Fetch all rows inside the transaction.
    async fn all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Make every statement of the transaction durable.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every statement of the transaction.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Capability contract hiding the underlying database engine.
///
/// Engine errors are returned as [`RunscopeError::Database`] wrapping the
/// driver error untouched; the adapter never retries or translates them.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short backend name, for logs.
    fn backend_name(&self) -> &'static str;

    /// Execute one or more `;`-separated DDL/utility statements.
    async fn exec(&self, script: &str) -> Result<()>;

    /// Execute a write statement.
    async fn run(&self, sql: &str, params: &[SqlValue]) -> Result<RunResult>;

    /// Fetch the first row, if any.
    async fn get(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>>;

    /// Fetch every row.
    async fn all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn AdapterTransaction>>;

    /// Placeholder token for the 1-based bound parameter `position`.
    fn placeholder(&self, position: usize) -> String;

    /// Dialect expression concatenating `column` across a group.
    fn string_aggregate(&self, column: &str, distinct: bool, delimiter: &str) -> String;

    /// Close every pooled connection.
    async fn close(&self);

    /// Round-trip a trivial query.
    async fn health_check(&self) -> Result<()> {
        self.get("SELECT 1 AS ok", &[]).await.map(|_| ())
    }
}

impl dyn StorageAdapter {
    /// Prepare a statement bound to this adapter.
    pub fn prepare(&self, sql: impl Into<String>) -> Statement<'_> {
        Statement {
            adapter: self,
            sql: sql.into(),
        }
    }

    /// Start a parameter list whose placeholders follow this adapter's dialect.
    pub fn params(&self) -> ParamList<'_> {
        ParamList::new(self)
    }
}

/// A statement prepared against an adapter, executable any number of times.
pub struct Statement<'a> {
    adapter: &'a dyn StorageAdapter,
    sql: String,
}

impl Statement<'_> {
    /// Execute as a write.
    pub async fn run(&self, params: &[SqlValue]) -> Result<RunResult> {
        self.adapter.run(&self.sql, params).await
    }

    /// Fetch the first row.
    pub async fn get(&self, params: &[SqlValue]) -> Result<Option<Row>> {
        self.adapter.get(&self.sql, params).await
    }

    /// Fetch every row.
    pub async fn all(&self, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.adapter.all(&self.sql, params).await
    }
}

/// Run `f` inside one transaction: commit on `Ok`, roll back on `Err`.
///
/// The closure receives the open transaction and must return a boxed future,
/// e.g. `transaction(adapter, move |tx| Box::pin(async move { ... }))`.
pub async fn transaction<T, F>(adapter: &dyn StorageAdapter, f: F) -> Result<T>
where
    T: Send,
    F: for<'t> FnOnce(&'t mut dyn AdapterTransaction) -> BoxFuture<'t, Result<T>> + Send,
{
    let mut tx = adapter.begin().await?;
    match f(tx.as_mut()).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter lists
// ---------------------------------------------------------------------------

/// Collects bound values while handing out matching dialect placeholders.
///
/// Push values in the order their placeholders appear in the SQL text.
pub struct ParamList<'a> {
    adapter: &'a dyn StorageAdapter,
    values: Vec<SqlValue>,
}

impl<'a> ParamList<'a> {
    /// Start an empty list.
    pub fn new(adapter: &'a dyn StorageAdapter) -> Self {
        Self {
            adapter,
            values: Vec::new(),
        }
    }

    /// Bind a value and return its placeholder.
    pub fn push(&mut self, value: impl Into<SqlValue>) -> String {
        self.values.push(value.into());
        self.adapter.placeholder(self.values.len())
    }

    /// Bind every value and return the comma-separated placeholders.
    pub fn push_all<I, V>(&mut self, values: I) -> String
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        values
            .into_iter()
            .map(|v| self.push(v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Bound values, in placeholder order.
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Consume the list, returning the bound values.
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}

/// Split a string-aggregate column into its non-blank parts.
pub fn split_aggregate(raw: Option<String>, delimiter: &str) -> Vec<String> {
    raw.map(|s| {
        s.split(delimiter)
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Quote a string literal for embedding in generated SQL.
pub(crate) fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Escape `LIKE` wildcards so `s` matches literally under [`LIKE_ESCAPE`].
pub(crate) fn escape_like(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Escape clause matching [`escape_like`].
pub(crate) const LIKE_ESCAPE: &str = "ESCAPE '\\'";

/// `%fragment%` pattern for a literal substring match.
pub(crate) fn contains_pattern(fragment: &str) -> String {
    format!("%{}%", escape_like(fragment))
}

/// Split a multi-statement script on `;`, dropping blank statements.
pub(crate) fn split_statements(script: &str) -> impl Iterator<Item = &str> {
    script
        .split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_accessors_coerce() {
        let mut row = Row::new();
        row.insert("n", SqlValue::Integer(7));
        row.insert("f", SqlValue::Real(2.5));
        row.insert("s", SqlValue::Text("12".to_string()));
        row.insert("null", SqlValue::Null);

        assert_eq!(row.int("n"), Some(7));
        assert_eq!(row.int("f"), Some(2));
        assert_eq!(row.int("s"), Some(12));
        assert_eq!(row.float("n"), Some(7.0));
        assert_eq!(row.text("n").as_deref(), Some("7"));
        assert_eq!(row.text("null"), None);
        assert_eq!(row.text("missing"), None);
        assert!(row.required_text("null").is_err());
    }

    #[test]
    fn test_option_into_sql_value() {
        assert_eq!(SqlValue::from(None::<String>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(3_i64)), SqlValue::Integer(3));
        assert!(SqlValue::from(None::<i64>).is_null());
    }

    #[test]
    fn test_split_aggregate_drops_blanks() {
        assert_eq!(
            split_aggregate(Some("llm,, chain ,".to_string()), ","),
            vec!["llm".to_string(), "chain".to_string()]
        );
        assert!(split_aggregate(None, ",").is_empty());
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("a'b"), "'a''b'");
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("plain"), "plain");
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
        assert_eq!(contains_pattern("th_1"), "%th\\_1%");
        assert_eq!(LIKE_ESCAPE, "ESCAPE '\\'");
    }

    #[test]
    fn test_split_statements() {
        let stmts: Vec<_> = split_statements("CREATE TABLE a (x TEXT);\n ;CREATE INDEX i ON a(x);  ").collect();
        assert_eq!(stmts, vec!["CREATE TABLE a (x TEXT)", "CREATE INDEX i ON a(x)"]);
    }
}
