//! Trace and thread projections.
//!
//! Nothing here owns storage. Traces and threads are computed on every read
//! by grouping `runs` on `trace_id` / `thread_id`; feedback and attachment
//! totals for a page of groups are then merged in from one grouped count
//! query each.

use runscope_core::{
    millis_to_datetime, Result, RunConditions, ThreadFilter, ThreadOverview, TraceConditions,
    TraceOverview,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::{
    contains_pattern, split_aggregate, ParamList, Row, StorageAdapter, LIKE_ESCAPE,
};
use crate::runs::{run_condition_clauses, DEFAULT_PAGE_SIZE};

/// Delimiter used for every string aggregate in this module. The ASCII unit
/// separator keeps names and ids containing commas whole.
const AGG_DELIMITER: &str = "\u{1f}";

/// Keys per `IN (...)` list when fetching grouped counts.
const COUNT_BATCH_SIZE: usize = 500;

/// `MIN`/`MAX`/`COUNT`/`SUM` columns shared by trace and thread groupings.
const GROUP_METRICS: &str = "COUNT(*) AS total_runs,
    MIN(CAST(start_time AS BIGINT)) AS first_run_time,
    MAX(COALESCE(CAST(end_time AS BIGINT), CAST(start_time AS BIGINT))) AS last_run_time,
    CAST(COALESCE(SUM(total_tokens), 0) AS BIGINT) AS total_tokens";

/// Most recently active group first.
const GROUP_ORDER: &str = "COALESCE(MAX(CAST(start_time AS BIGINT)), 0) DESC";

/// Page bounds for a grouped query.
#[derive(Debug, Clone, Copy)]
struct Page {
    limit: Option<u32>,
    offset: Option<u32>,
}

impl Page {
    const ALL: Page = Page {
        limit: None,
        offset: None,
    };

    fn sql(self, params: &mut ParamList<'_>) -> String {
        match (self.limit, self.offset) {
            (None, None) => String::new(),
            (limit, offset) => format!(
                " LIMIT {} OFFSET {}",
                params.push(limit.map_or(i64::MAX, i64::from)),
                params.push(offset.unwrap_or(0))
            ),
        }
    }
}

fn time_column(row: &Row, column: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    row.int(column).and_then(millis_to_datetime)
}

fn key_clause(column: &str, placeholders: &str) -> String {
    format!("{column} IN ({placeholders})")
}

/// Project one run-table condition set onto the trace filter columns.
fn trace_run_conditions(c: &TraceConditions) -> RunConditions {
    RunConditions {
        system: c.system.clone(),
        thread_id: c.thread_id.clone(),
        user_id: c.user_id.clone(),
        run_type: c.run_type.clone(),
        model_name: c.model_name.clone(),
        ..RunConditions::new()
    }
}

/// Read-time trace and thread aggregates.
#[derive(Clone)]
pub struct TraceRepository {
    adapter: Arc<dyn StorageAdapter>,
}

impl TraceRepository {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    fn agg(&self, column: &str) -> String {
        self.adapter.string_aggregate(column, true, AGG_DELIMITER)
    }

    // -- Traces -------------------------------------------------------------

    /// Overview of one trace, or `None` when no run carries this trace id.
    pub async fn get_trace_overview(&self, trace_id: &str) -> Result<Option<TraceOverview>> {
        let overviews = self
            .trace_overviews(Some(trace_id), &RunConditions::new(), Page::ALL)
            .await?;
        Ok(overviews.into_iter().next())
    }

    /// Every trace, most recently active first.
    pub async fn list_trace_overviews(&self, limit: u32, offset: u32) -> Result<Vec<TraceOverview>> {
        let page = Page {
            limit: Some(limit),
            offset: Some(offset),
        };
        self.trace_overviews(None, &RunConditions::new(), page).await
    }

    /// Traces with at least one run in `system`.
    pub async fn get_trace_overviews_by_system(
        &self,
        system: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TraceOverview>> {
        let page = Page {
            limit: Some(limit),
            offset: Some(offset),
        };
        self.trace_overviews(None, &RunConditions::new().with_system(system), page)
            .await
    }

    /// Every trace with at least one run in the thread.
    pub async fn get_traces_by_thread_id(&self, thread_id: &str) -> Result<Vec<TraceOverview>> {
        let conditions = RunConditions {
            thread_id: Some(thread_id.to_string()),
            ..RunConditions::new()
        };
        self.trace_overviews(None, &conditions, Page::ALL).await
    }

    /// Traces with at least one run matching every present condition.
    pub async fn get_traces_by_conditions(
        &self,
        conditions: &TraceConditions,
    ) -> Result<Vec<TraceOverview>> {
        let page = Page {
            limit: Some(conditions.limit.unwrap_or(DEFAULT_PAGE_SIZE)),
            offset: conditions.offset,
        };
        self.trace_overviews(None, &trace_run_conditions(conditions), page)
            .await
    }

    /// Number of traces [`Self::get_traces_by_conditions`] pages over.
    pub async fn count_traces_by_conditions(&self, conditions: &TraceConditions) -> Result<i64> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let mut clauses = vec!["trace_id IS NOT NULL".to_string(), "trace_id <> ''".to_string()];
        clauses.extend(run_condition_clauses(
            &mut params,
            &trace_run_conditions(conditions),
        ));
        let sql = format!(
            "SELECT COUNT(DISTINCT trace_id) AS total FROM runs WHERE {}",
            clauses.join(" AND ")
        );
        let row = adapter.get(&sql, params.values()).await?;
        Ok(row.and_then(|r| r.int("total")).unwrap_or(0))
    }

    async fn trace_overviews(
        &self,
        trace_id: Option<&str>,
        conditions: &RunConditions,
        page: Page,
    ) -> Result<Vec<TraceOverview>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let mut clauses = vec!["trace_id IS NOT NULL".to_string(), "trace_id <> ''".to_string()];
        if let Some(trace_id) = trace_id {
            clauses.push(format!("trace_id = {}", params.push(trace_id)));
        }
        let inner = run_condition_clauses(&mut params, conditions);
        if !inner.is_empty() {
            clauses.push(format!(
                "trace_id IN (SELECT trace_id FROM runs WHERE {})",
                inner.join(" AND ")
            ));
        }
        let page_sql = page.sql(&mut params);
        let sql = format!(
            "SELECT trace_id, {GROUP_METRICS},
                {} AS run_types, {} AS systems, {} AS user_ids, {} AS thread_ids
             FROM runs WHERE {}
             GROUP BY trace_id
             ORDER BY {GROUP_ORDER}, trace_id{page_sql}",
            self.agg("run_type"),
            self.agg("system"),
            self.agg("user_id"),
            self.agg("thread_id"),
            clauses.join(" AND ")
        );
        let rows = adapter.all(&sql, params.values()).await?;

        let mut overviews = rows
            .iter()
            .map(|row| {
                Ok(TraceOverview {
                    trace_id: row.required_text("trace_id")?,
                    total_runs: row.int("total_runs").unwrap_or(0),
                    total_feedback: 0,
                    total_attachments: 0,
                    first_run_time: time_column(row, "first_run_time"),
                    last_run_time: time_column(row, "last_run_time"),
                    run_types: split_aggregate(row.text("run_types"), AGG_DELIMITER),
                    systems: split_aggregate(row.text("systems"), AGG_DELIMITER),
                    user_ids: split_aggregate(row.text("user_ids"), AGG_DELIMITER),
                    thread_ids: split_aggregate(row.text("thread_ids"), AGG_DELIMITER),
                    total_tokens: row.int("total_tokens").unwrap_or(0),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let keys: Vec<String> = overviews.iter().map(|o| o.trace_id.clone()).collect();
        let feedback = self
            .grouped_counts(&keys, |keys| {
                format!(
                    "SELECT trace_id AS group_key, COUNT(*) AS total FROM feedback
                     WHERE {} GROUP BY trace_id",
                    key_clause("trace_id", keys)
                )
            })
            .await?;
        let attachments = self
            .grouped_counts(&keys, |keys| {
                format!(
                    "SELECT r.trace_id AS group_key, COUNT(*) AS total
                     FROM attachments a JOIN runs r ON a.run_id = r.id
                     WHERE {} GROUP BY r.trace_id",
                    key_clause("r.trace_id", keys)
                )
            })
            .await?;
        for overview in &mut overviews {
            overview.total_feedback = feedback.get(&overview.trace_id).copied().unwrap_or(0);
            overview.total_attachments = attachments.get(&overview.trace_id).copied().unwrap_or(0);
        }
        Ok(overviews)
    }

    // -- Threads ------------------------------------------------------------

    /// Overview of one thread, or `None` when no run carries this thread id.
    pub async fn get_thread_overview(&self, thread_id: &str) -> Result<Option<ThreadOverview>> {
        let overviews = self
            .thread_overviews(Some(thread_id), &ThreadFilter::default())
            .await?;
        Ok(overviews.into_iter().next())
    }

    /// Threads matching the filter, most recently active first. `thread_id`
    /// is a substring match; `system` matches any run of the thread.
    pub async fn get_thread_overviews(&self, filter: &ThreadFilter) -> Result<Vec<ThreadOverview>> {
        self.thread_overviews(None, filter).await
    }

    /// Number of threads matching the filter; limit and offset are ignored.
    pub async fn count_thread_overviews(&self, filter: &ThreadFilter) -> Result<i64> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let clauses = thread_clauses(&mut params, None, filter);
        let sql = format!(
            "SELECT COUNT(DISTINCT thread_id) AS total FROM runs WHERE {}",
            clauses.join(" AND ")
        );
        let row = adapter.get(&sql, params.values()).await?;
        Ok(row.and_then(|r| r.int("total")).unwrap_or(0))
    }

    async fn thread_overviews(
        &self,
        thread_id: Option<&str>,
        filter: &ThreadFilter,
    ) -> Result<Vec<ThreadOverview>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let clauses = thread_clauses(&mut params, thread_id, filter);
        let page = Page {
            limit: filter.limit,
            offset: filter.offset,
        };
        let page_sql = page.sql(&mut params);
        let sql = format!(
            "SELECT thread_id, {GROUP_METRICS},
                COUNT(DISTINCT trace_id) AS total_traces,
                {} AS run_types, {} AS systems, {} AS user_ids
             FROM runs WHERE {}
             GROUP BY thread_id
             ORDER BY {GROUP_ORDER}, thread_id{page_sql}",
            self.agg("run_type"),
            self.agg("system"),
            self.agg("user_id"),
            clauses.join(" AND ")
        );
        let rows = adapter.all(&sql, params.values()).await?;

        let mut overviews = rows
            .iter()
            .map(|row| {
                Ok(ThreadOverview {
                    thread_id: row.required_text("thread_id")?,
                    total_runs: row.int("total_runs").unwrap_or(0),
                    total_traces: row.int("total_traces").unwrap_or(0),
                    total_feedback: 0,
                    total_attachments: 0,
                    first_run_time: time_column(row, "first_run_time"),
                    last_run_time: time_column(row, "last_run_time"),
                    run_types: split_aggregate(row.text("run_types"), AGG_DELIMITER),
                    systems: split_aggregate(row.text("systems"), AGG_DELIMITER),
                    user_ids: split_aggregate(row.text("user_ids"), AGG_DELIMITER),
                    total_tokens: row.int("total_tokens").unwrap_or(0),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let keys: Vec<String> = overviews.iter().map(|o| o.thread_id.clone()).collect();
        let feedback = self
            .grouped_counts(&keys, |keys| {
                format!(
                    "SELECT r.thread_id AS group_key, COUNT(*) AS total
                     FROM feedback f JOIN runs r ON f.run_id = r.id
                     WHERE {} GROUP BY r.thread_id",
                    key_clause("r.thread_id", keys)
                )
            })
            .await?;
        let attachments = self
            .grouped_counts(&keys, |keys| {
                format!(
                    "SELECT r.thread_id AS group_key, COUNT(*) AS total
                     FROM attachments a JOIN runs r ON a.run_id = r.id
                     WHERE {} GROUP BY r.thread_id",
                    key_clause("r.thread_id", keys)
                )
            })
            .await?;
        for overview in &mut overviews {
            overview.total_feedback = feedback.get(&overview.thread_id).copied().unwrap_or(0);
            overview.total_attachments = attachments.get(&overview.thread_id).copied().unwrap_or(0);
        }
        Ok(overviews)
    }

    // -- Batched counts -----------------------------------------------------

    /// Run a `group_key`/`total` count query over `keys` in batches.
    ///
    /// `build` receives the comma-separated placeholders of one batch.
    async fn grouped_counts<F>(&self, keys: &[String], build: F) -> Result<HashMap<String, i64>>
    where
        F: Fn(&str) -> String,
    {
        let mut counts = HashMap::new();
        let adapter = self.adapter.as_ref();
        for batch in keys.chunks(COUNT_BATCH_SIZE) {
            let mut params = adapter.params();
            let placeholders = params.push_all(batch);
            let rows = adapter.all(&build(&placeholders), params.values()).await?;
            for row in &rows {
                if let Some(key) = row.text("group_key") {
                    counts.insert(key, row.int("total").unwrap_or(0));
                }
            }
        }
        Ok(counts)
    }
}

/// WHERE predicates selecting the threads a filter covers.
fn thread_clauses(
    params: &mut ParamList<'_>,
    thread_id: Option<&str>,
    filter: &ThreadFilter,
) -> Vec<String> {
    let mut clauses = vec!["thread_id IS NOT NULL".to_string(), "thread_id <> ''".to_string()];
    if let Some(thread_id) = thread_id {
        clauses.push(format!("thread_id = {}", params.push(thread_id)));
    }
    if let Some(fragment) = &filter.thread_id {
        clauses.push(format!(
            "thread_id LIKE {} {LIKE_ESCAPE}",
            params.push(contains_pattern(fragment))
        ));
    }
    if let Some(system) = &filter.system {
        clauses.push(format!(
            "thread_id IN (SELECT thread_id FROM runs WHERE system = {})",
            params.push(system)
        ));
    }
    clauses
}
