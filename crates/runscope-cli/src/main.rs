//! Runscope maintenance CLI
//!
//! Operates directly on the run store: schema setup, system reference
//! checks, hourly rollup maintenance and JSON dumps of the read-side
//! projections. Results go to stdout as JSON; logs go to stderr.

mod config;
mod logging;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use runscope_core::{millis_to_datetime, parse_timestamp_millis, RunscopeConfig, StatsFilter, ThreadFilter};
use runscope_storage::{RunStatsRepository, Storage};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// Command-line interface for a Runscope run store.
#[derive(Parser, Debug)]
#[command(name = "runscope", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(long, short, env = "RUNSCOPE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override `storage.database_url`
    #[arg(long, env = "RUNSCOPE_DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create tables and indexes
    Init,

    /// Create system records for every system name seen only on runs
    BackfillSystems,

    /// List system names used by runs that have no system record
    ValidateSystems,

    /// List system records
    Systems,

    /// Aggregate counts for one system
    SystemStats {
        /// System name
        name: String,
    },

    /// Force recomputation of hourly rollups in a window
    Rollup(WindowArgs),

    /// Hourly statistics for a window, computing missing hours first
    Stats {
        #[command(flatten)]
        window: WindowArgs,

        /// Only this model
        #[arg(long)]
        model: Option<String>,

        /// Only this system
        #[arg(long)]
        system: Option<String>,

        /// Print window totals instead of hourly rows
        #[arg(long)]
        summary: bool,
    },

    /// Overview of one trace
    Trace {
        /// Trace id
        trace_id: String,
    },

    /// Thread overviews
    Threads {
        /// Substring of the thread id
        #[arg(long)]
        thread_id: Option<String>,

        /// Only threads with a run in this system
        #[arg(long)]
        system: Option<String>,

        #[arg(long, default_value_t = runscope_storage::DEFAULT_PAGE_SIZE)]
        limit: u32,

        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
}

/// Time window `[start, end)`.
#[derive(clap::Args, Debug)]
struct WindowArgs {
    /// Window start: RFC 3339 or epoch milliseconds
    #[arg(long, value_parser = parse_time)]
    start: DateTime<Utc>,

    /// Window end (exclusive): RFC 3339 or epoch milliseconds
    #[arg(long, value_parser = parse_time)]
    end: DateTime<Utc>,
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp_millis(raw)
        .and_then(millis_to_datetime)
        .ok_or_else(|| format!("'{raw}' is neither RFC 3339 nor epoch milliseconds"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_runscope_config(cli.config.as_deref())?;
    if let Some(url) = cli.database_url.clone() {
        config.storage.database_url = url;
    }
    logging::init_subscriber(&config.logging)?;

    let storage = Storage::open(&config.storage, &config.stats)
        .await
        .context("Failed to open storage")?;
    let outcome = run(&cli.command, &storage).await;
    storage.close().await;
    outcome
}

/// Load configuration from `path`, or fall back to defaults.
fn load_runscope_config(path: Option<&std::path::Path>) -> anyhow::Result<RunscopeConfig> {
    match path {
        Some(path) => config::load_config(path),
        None => {
            let config = RunscopeConfig::default();
            config::validate(&config)?;
            Ok(config)
        }
    }
}

async fn run(command: &Command, storage: &Storage) -> anyhow::Result<()> {
    match command {
        Command::Init => {
            runscope_storage::initialize_schema(storage.adapter.as_ref()).await?;
            info!(backend = storage.adapter.backend_name(), "Schema ready");
        }
        Command::BackfillSystems => {
            let created = storage.systems.migrate_existing_runs_to_systems().await?;
            info!(created = created.len(), "System backfill finished");
            print_json(&created)?;
        }
        Command::ValidateSystems => {
            let orphans = storage.systems.validate_system_references().await?;
            print_json(&orphans)?;
            if !orphans.is_empty() {
                warn!(orphans = orphans.len(), "Runs reference unknown systems");
                anyhow::bail!(
                    "{} system name(s) have no system record; run `runscope backfill-systems`",
                    orphans.len()
                );
            }
        }
        Command::Systems => print_json(&storage.systems.list_systems().await?)?,
        Command::SystemStats { name } => {
            print_json(&storage.systems.get_system_stats(name).await?)?;
        }
        Command::Rollup(window) => {
            let groups = storage.stats.recompute_range(window.start, window.end).await?;
            info!(start = %window.start, end = %window.end, groups, "Hourly rollups recomputed");
        }
        Command::Stats {
            window,
            model,
            system,
            summary,
        } => {
            let filter = StatsFilter {
                model_name: model.clone(),
                system: system.clone(),
            };
            let stats = storage
                .stats
                .get_stats(window.start, window.end, &filter)
                .await?;
            if *summary {
                print_json(&RunStatsRepository::summarize(&stats))?;
            } else {
                print_json(&stats)?;
            }
        }
        Command::Trace { trace_id } => match storage.traces.get_trace_overview(trace_id).await? {
            Some(overview) => print_json(&overview)?,
            None => anyhow::bail!("Trace '{trace_id}' not found"),
        },
        Command::Threads {
            thread_id,
            system,
            limit,
            offset,
        } => {
            let filter = ThreadFilter {
                system: system.clone(),
                thread_id: thread_id.clone(),
                limit: Some(*limit),
                offset: Some(*offset),
            };
            print_json(&storage.traces.get_thread_overviews(&filter).await?)?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_time_accepts_both_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap();
        assert_eq!(parse_time("2024-01-01T00:10:00Z").unwrap(), expected);
        assert_eq!(parse_time("1704067800000").unwrap(), expected);
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn test_stats_arguments() {
        let cli = Cli::try_parse_from([
            "runscope",
            "stats",
            "--start",
            "2024-01-01T00:00:00Z",
            "--end",
            "2024-01-02T00:00:00Z",
            "--model",
            "gpt-4",
            "--summary",
        ])
        .unwrap();
        match cli.command {
            Command::Stats {
                window,
                model,
                system,
                summary,
            } => {
                assert_eq!(window.end - window.start, chrono::Duration::days(1));
                assert_eq!(model.as_deref(), Some("gpt-4"));
                assert!(system.is_none());
                assert!(summary);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_rollup_rejects_bad_time() {
        let parsed = Cli::try_parse_from(["runscope", "rollup", "--start", "soon", "--end", "0"]);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn test_commands_against_memory_storage() {
        let storage = runscope_storage::StorageProfile::Memory.build().await.unwrap();
        storage
            .runs
            .create_run(&runscope_core::RunPayload {
                trace_id: Some("t1".to_string()),
                system: Some("acme".to_string()),
                model_name: Some("gpt-4".to_string()),
                start_time: Some(runscope_core::RunTime::Millis(1_704_067_800_000)),
                ..Default::default()
            })
            .await
            .unwrap();

        run(&Command::ValidateSystems, &storage).await.unwrap();
        run(&Command::Trace { trace_id: "t1".to_string() }, &storage)
            .await
            .unwrap();
        assert!(run(&Command::Trace { trace_id: "nope".to_string() }, &storage)
            .await
            .is_err());

        let window = WindowArgs {
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
        };
        run(&Command::Rollup(window), &storage).await.unwrap();
        let rows = storage
            .adapter
            .all("SELECT total_runs FROM run_stats_hourly", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].int("total_runs"), Some(1));
    }
}
