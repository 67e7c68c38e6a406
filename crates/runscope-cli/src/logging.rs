//! Tracing subscriber initialization.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//!
//! Filter priority, highest first:
//!
//! 1. `RUNSCOPE_LOG` (per-target directives, e.g. `runscope_storage=debug,warn`)
//! 2. `RUST_LOG`
//! 3. `logging.level` from the configuration file

use runscope_core::LoggingConfig;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const PROJECT_ENV: &str = "RUNSCOPE_LOG";
const FALLBACK_DIRECTIVES: &str = "info";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_subscriber(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_env_filter(
        std::env::var(PROJECT_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        &config.level,
    );
    let fmt_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.format == "json" {
        registry.with(fmt_layer.json()).try_init()
    } else {
        registry.with(fmt_layer.compact()).try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

/// First candidate that parses wins; unparseable values fall through.
fn build_env_filter(project: Option<String>, rust_log: Option<String>, level: &str) -> EnvFilter {
    [project, rust_log, Some(level.to_string())]
        .into_iter()
        .flatten()
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(FALLBACK_DIRECTIVES))
}
