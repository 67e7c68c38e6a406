//! Hourly run statistics.
//!
//! `run_stats_hourly` is a cache of per-hour rollups grouped by
//! model x system. Hours are materialised lazily: a range read first makes
//! sure every hour of the window has been computed, then serves the window
//! from the rollup table. Each hour moves through
//!
//! ```text
//! absent --(first read touching the hour)--> computing --(commit)--> present
//! ```
//!
//! and a computation always rebuilds the hour from the full current set of
//! runs, so recomputing is idempotent. Two readers racing on the same hour
//! may both compute it; the upsert keeps the outcome consistent.
//!
//! An hour with no runs is never materialised and stays absent. A present
//! hour is served as stored, even while it is still open, unless
//! [`StatsConfig::recompute_open_hours`] is set; [`RunStatsRepository::recompute_range`]
//! rebuilds hours explicitly.

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt, TryStreamExt};
use runscope_core::extract::error_text_present;
use runscope_core::{
    millis_to_datetime, HourlyStat, Result, RunscopeError, StatsConfig, StatsFilter, StatsSummary,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::adapter::{transaction, Row, SqlValue, StorageAdapter};
use crate::convert::non_empty;

/// One hour in epoch milliseconds.
pub const HOUR_MS: i64 = 3_600_000;

/// Stored value of the null system dimension.
const NO_SYSTEM: &str = "";

const STAT_COLUMNS: &str = "stat_hour, model_name, system, total_runs, successful_runs, \
     failed_runs, error_rate, total_duration_ms, avg_duration_ms, p95_duration_ms, \
     p99_duration_ms, total_tokens_sum, avg_tokens_per_run, avg_ttft_ms, p95_ttft_ms, \
     distinct_users";

const STAT_COLUMN_COUNT: usize = 16;

/// Columns replaced on conflict: everything but the key triple.
const UPDATE_COLUMNS: &[&str] = &[
    "total_runs",
    "successful_runs",
    "failed_runs",
    "error_rate",
    "total_duration_ms",
    "avg_duration_ms",
    "p95_duration_ms",
    "p99_duration_ms",
    "total_tokens_sum",
    "avg_tokens_per_run",
    "avg_ttft_ms",
    "p95_ttft_ms",
    "distinct_users",
];

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Round epoch milliseconds down to the top of the hour.
pub fn align_to_hour(ms: i64) -> i64 {
    ms.div_euclid(HOUR_MS) * HOUR_MS
}

/// Number of hour buckets in `[align_to_hour(start), end)`.
pub fn hour_count(start_ms: i64, end_ms: i64) -> u64 {
    let start = align_to_hour(start_ms);
    if end_ms <= start {
        return 0;
    }
    (end_ms - start).unsigned_abs().div_ceil(HOUR_MS.unsigned_abs())
}

/// Hour starts covering `[align_to_hour(start), end)`.
pub fn hours_in_range(start_ms: i64, end_ms: i64) -> Vec<i64> {
    let mut hours = Vec::new();
    let mut hour = align_to_hour(start_ms);
    while hour < end_ms {
        hours.push(hour);
        hour += HOUR_MS;
    }
    hours
}

/// Nearest-rank percentile without interpolation: `sorted[floor(p * n)]`,
/// or 0 for an empty slice. `sorted` must be ascending.
pub fn percentile(sorted: &[i64], p: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = (p * sorted.len() as f64).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Collapse empty and `"N/A"` dimension values (model or system) into null.
pub fn normalize_dimension(value: Option<&str>) -> Option<String> {
    non_empty(value)
        .filter(|s| *s != "N/A")
        .map(str::to_string)
}

fn ratio(numerator: i64, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// The fields of one run that feed the rollup.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunSample {
    pub(crate) model_name: Option<String>,
    pub(crate) system: Option<String>,
    pub(crate) start_ms: Option<i64>,
    pub(crate) end_ms: Option<i64>,
    pub(crate) failed: bool,
    pub(crate) total_tokens: i64,
    pub(crate) ttft_ms: i64,
    pub(crate) user_id: Option<String>,
}

impl RunSample {
    fn from_row(row: &Row) -> Self {
        Self {
            model_name: row.text("model_name"),
            system: row.text("system"),
            start_ms: row.int("start_time"),
            end_ms: row.int("end_time"),
            failed: error_text_present(row.text("error").as_deref()),
            total_tokens: row.int("total_tokens").unwrap_or(0),
            ttft_ms: row.int("time_to_first_token").unwrap_or(0),
            user_id: row.text("user_id"),
        }
    }
}

/// Group one hour of runs by model x system and compute each group's row.
///
/// Both dimensions are normalised with [`normalize_dimension`]; runs left
/// without a model are skipped. The result is ordered by model, then system.
pub(crate) fn compute_hour(stat_hour: DateTime<Utc>, samples: &[RunSample]) -> Vec<HourlyStat> {
    let mut groups: BTreeMap<(String, Option<String>), Vec<&RunSample>> = BTreeMap::new();
    for sample in samples {
        let Some(model) = normalize_dimension(sample.model_name.as_deref()) else {
            continue;
        };
        let key = (model, normalize_dimension(sample.system.as_deref()));
        groups.entry(key).or_default().push(sample);
    }

    groups
        .into_iter()
        .map(|((model_name, system), runs)| {
            let total_runs = runs.len();
            let failed_runs = runs.iter().filter(|r| r.failed).count();

            let mut durations: Vec<i64> = runs
                .iter()
                .filter_map(|r| match (r.start_ms, r.end_ms) {
                    (Some(start), Some(end)) => Some(end - start),
                    _ => None,
                })
                .collect();
            durations.sort_unstable();
            let total_duration_ms: i64 = durations.iter().sum();

            let mut ttfts: Vec<i64> = runs.iter().map(|r| r.ttft_ms).filter(|t| *t > 0).collect();
            ttfts.sort_unstable();

            let total_tokens_sum: i64 = runs.iter().map(|r| r.total_tokens).sum();
            let distinct_users = runs
                .iter()
                .filter_map(|r| non_empty(r.user_id.as_deref()))
                .collect::<HashSet<_>>()
                .len();

            HourlyStat {
                stat_hour,
                model_name,
                system,
                total_runs: total_runs as i64,
                successful_runs: (total_runs - failed_runs) as i64,
                failed_runs: failed_runs as i64,
                error_rate: ratio(failed_runs as i64, total_runs),
                total_duration_ms,
                avg_duration_ms: ratio(total_duration_ms, durations.len()),
                p95_duration_ms: percentile(&durations, 0.95),
                p99_duration_ms: percentile(&durations, 0.99),
                total_tokens_sum,
                avg_tokens_per_run: ratio(total_tokens_sum, total_runs),
                avg_ttft_ms: ratio(ttfts.iter().sum(), ttfts.len()),
                p95_ttft_ms: percentile(&ttfts, 0.95),
                distinct_users: distinct_users as i64,
            }
        })
        .collect()
}

fn stat_from_row(row: &Row) -> Result<HourlyStat> {
    let stat_hour = row
        .int("stat_hour")
        .and_then(millis_to_datetime)
        .ok_or_else(|| RunscopeError::Storage("Invalid stat_hour in run_stats_hourly".to_string()))?;
    Ok(HourlyStat {
        stat_hour,
        model_name: row.required_text("model_name")?,
        system: normalize_dimension(row.text("system").as_deref()),
        total_runs: row.int("total_runs").unwrap_or(0),
        successful_runs: row.int("successful_runs").unwrap_or(0),
        failed_runs: row.int("failed_runs").unwrap_or(0),
        error_rate: row.float("error_rate").unwrap_or(0.0),
        total_duration_ms: row.int("total_duration_ms").unwrap_or(0),
        avg_duration_ms: row.float("avg_duration_ms").unwrap_or(0.0),
        p95_duration_ms: row.int("p95_duration_ms").unwrap_or(0),
        p99_duration_ms: row.int("p99_duration_ms").unwrap_or(0),
        total_tokens_sum: row.int("total_tokens_sum").unwrap_or(0),
        avg_tokens_per_run: row.float("avg_tokens_per_run").unwrap_or(0.0),
        avg_ttft_ms: row.float("avg_ttft_ms").unwrap_or(0.0),
        p95_ttft_ms: row.int("p95_ttft_ms").unwrap_or(0),
        distinct_users: row.int("distinct_users").unwrap_or(0),
    })
}

fn stat_values(stat: &HourlyStat) -> Vec<SqlValue> {
    vec![
        SqlValue::Integer(stat.stat_hour.timestamp_millis()),
        SqlValue::from(&stat.model_name),
        SqlValue::from(stat.system.as_deref().unwrap_or(NO_SYSTEM)),
        SqlValue::Integer(stat.total_runs),
        SqlValue::Integer(stat.successful_runs),
        SqlValue::Integer(stat.failed_runs),
        SqlValue::Real(stat.error_rate),
        SqlValue::Integer(stat.total_duration_ms),
        SqlValue::Real(stat.avg_duration_ms),
        SqlValue::Integer(stat.p95_duration_ms),
        SqlValue::Integer(stat.p99_duration_ms),
        SqlValue::Integer(stat.total_tokens_sum),
        SqlValue::Real(stat.avg_tokens_per_run),
        SqlValue::Real(stat.avg_ttft_ms),
        SqlValue::Integer(stat.p95_ttft_ms),
        SqlValue::Integer(stat.distinct_users),
    ]
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Lazily materialised hourly rollups.
#[derive(Clone)]
pub struct RunStatsRepository {
    adapter: Arc<dyn StorageAdapter>,
    config: StatsConfig,
}

impl RunStatsRepository {
    pub fn new(adapter: Arc<dyn StorageAdapter>, config: StatsConfig) -> Self {
        Self { adapter, config }
    }

    /// Hourly rows for `[start, end)`, most recent hour first.
    ///
    /// `start` is aligned down to its hour. Every hour of the window is
    /// computed first if it is not present yet. Windows wider than
    /// [`StatsConfig::max_window_hours`] are rejected.
    pub async fn get_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &StatsFilter,
    ) -> Result<Vec<HourlyStat>> {
        self.check_window(start, end)?;
        let start_ms = align_to_hour(start.timestamp_millis());
        let end_ms = end.timestamp_millis();

        let computed: Vec<bool> = stream::iter(hours_in_range(start_ms, end_ms))
            .map(|hour| self.ensure_stats_for_hour(hour))
            .buffer_unordered(self.config.hour_check_concurrency.max(1))
            .try_collect()
            .await?;
        debug!(
            hours = computed.len(),
            computed = computed.iter().filter(|c| **c).count(),
            "Hourly stats coverage ensured"
        );

        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let mut clauses = vec![
            format!("stat_hour >= {}", params.push(start_ms)),
            format!("stat_hour < {}", params.push(end_ms)),
        ];
        if let Some(model) = &filter.model_name {
            clauses.push(format!("model_name = {}", params.push(model)));
        }
        if let Some(system) = &filter.system {
            let stored = normalize_dimension(Some(system)).unwrap_or_default();
            clauses.push(format!("system = {}", params.push(stored)));
        }
        let sql = format!(
            "SELECT {STAT_COLUMNS} FROM run_stats_hourly WHERE {}
             ORDER BY stat_hour DESC, model_name ASC, system ASC",
            clauses.join(" AND ")
        );
        let rows = adapter.all(&sql, params.values()).await?;
        rows.iter().map(stat_from_row).collect()
    }

    fn check_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
        let hours = hour_count(start.timestamp_millis(), end.timestamp_millis());
        let max = self.config.max_window_hours as u64;
        if hours > max {
            return Err(RunscopeError::InvalidInput(format!(
                "Stats window {start} .. {end} spans {hours} hours; at most {max} are allowed"
            )));
        }
        Ok(())
    }

    /// Compute `hour_ms` unless it is already present. Returns whether a
    /// computation ran.
    pub async fn ensure_stats_for_hour(&self, hour_ms: i64) -> Result<bool> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!(
            "SELECT stat_hour FROM run_stats_hourly WHERE stat_hour = {} LIMIT 1",
            params.push(hour_ms)
        );
        let present = adapter.get(&sql, params.values()).await?.is_some();
        let open = hour_ms + HOUR_MS > Utc::now().timestamp_millis();
        if present && !(open && self.config.recompute_open_hours) {
            return Ok(false);
        }
        self.update_hourly_stats(hour_ms).await?;
        Ok(true)
    }

    /// Rebuild the rollup rows of one hour from its runs. Returns the number
    /// of model x system groups written; an hour without runs writes nothing.
    pub async fn update_hourly_stats(&self, hour_ms: i64) -> Result<usize> {
        let hour_ms = align_to_hour(hour_ms);
        let stat_hour = millis_to_datetime(hour_ms)
            .ok_or_else(|| RunscopeError::Storage(format!("Hour {hour_ms} is out of range")))?;

        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let delete = format!(
            "DELETE FROM run_stats_hourly WHERE stat_hour = {}",
            params.push(hour_ms)
        );
        let delete_params = params.into_values();

        let mut params = adapter.params();
        let select = format!(
            "SELECT model_name, system, start_time, end_time, error, total_tokens,
                time_to_first_token, user_id
             FROM runs
             WHERE start_time IS NOT NULL
               AND CAST(start_time AS BIGINT) >= {}
               AND CAST(start_time AS BIGINT) < {}",
            params.push(hour_ms),
            params.push(hour_ms + HOUR_MS)
        );
        let select_params = params.into_values();

        let placeholders = (1..=STAT_COLUMN_COUNT)
            .map(|position| adapter.placeholder(position))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = UPDATE_COLUMNS
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let upsert = format!(
            "INSERT INTO run_stats_hourly ({STAT_COLUMNS}) VALUES ({placeholders})
             ON CONFLICT (stat_hour, model_name, system) DO UPDATE SET {updates}"
        );

        // The hour is rebuilt whole from one consistent read: rows for groups
        // that no longer exist go too. The DELETE runs first so the write
        // lock is held before the runs are read.
        let (runs, groups) = transaction(adapter, move |tx| {
            Box::pin(async move {
                tx.run(&delete, &delete_params).await?;
                let rows = tx.all(&select, &select_params).await?;
                let samples: Vec<RunSample> = rows.iter().map(RunSample::from_row).collect();
                let stats = compute_hour(stat_hour, &samples);
                for stat in &stats {
                    tx.run(&upsert, &stat_values(stat)).await?;
                }
                Ok((samples.len(), stats.len()))
            })
        })
        .await?;

        if groups == 0 {
            debug!(hour = %stat_hour, runs, "No hourly stats to materialise");
        } else {
            debug!(hour = %stat_hour, runs, groups, "Hourly stats materialised");
        }
        Ok(groups)
    }

    /// Recompute every hour of `[start, end)` regardless of what is stored.
    /// Returns the number of groups written.
    pub async fn recompute_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        self.check_window(start, end)?;
        let written: Vec<usize> =
            stream::iter(hours_in_range(start.timestamp_millis(), end.timestamp_millis()))
                .map(|hour| self.update_hourly_stats(hour))
                .buffer_unordered(self.config.hour_check_concurrency.max(1))
                .try_collect()
                .await?;
        Ok(written.into_iter().sum())
    }

    /// Fold hourly rows into window totals. Averages are weighted by each
    /// row's run count.
    pub fn summarize(stats: &[HourlyStat]) -> StatsSummary {
        let total_runs: i64 = stats.iter().map(|s| s.total_runs).sum();
        let successful_runs: i64 = stats.iter().map(|s| s.successful_runs).sum();
        let failed_runs: i64 = stats.iter().map(|s| s.failed_runs).sum();
        let total_tokens_sum: i64 = stats.iter().map(|s| s.total_tokens_sum).sum();
        let weighted_duration: f64 = stats
            .iter()
            .map(|s| s.avg_duration_ms * s.total_runs as f64)
            .sum();
        let per_run = |value: f64| {
            if total_runs == 0 {
                0.0
            } else {
                value / total_runs as f64
            }
        };

        StatsSummary {
            total_runs,
            successful_runs,
            failed_runs,
            error_rate: per_run(failed_runs as f64),
            total_tokens_sum,
            avg_tokens_per_run: per_run(total_tokens_sum as f64),
            avg_duration_ms: per_run(weighted_duration),
            max_p95_duration_ms: stats.iter().map(|s| s.p95_duration_ms).max().unwrap_or(0),
        }
    }
}
