//! Storage layer for Runscope
//!
//! A thin [`StorageAdapter`] hides the SQL dialect (SQLite, PostgreSQL) and
//! the repositories build portable SQL on top of it. [`StorageProfile`] picks
//! a backend and returns a wired [`Storage`] composite.

pub mod adapter;
pub mod attachments;
mod convert;
pub mod feedback;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod runs;
pub mod schema;
pub mod sqlite;
pub mod stats;
pub mod systems;
pub mod traces;

pub use adapter::{transaction, AdapterTransaction, Row, RunResult, SqlValue, StorageAdapter};
pub use attachments::AttachmentRepository;
pub use feedback::FeedbackRepository;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAdapter;
pub use runs::{RunRepository, DEFAULT_PAGE_SIZE};
pub use schema::initialize_schema;
pub use sqlite::SqliteAdapter;
pub use stats::RunStatsRepository;
pub use systems::{generate_api_key, SystemRepository};
pub use traces::TraceRepository;

use runscope_core::{Result, RunscopeError, StatsConfig, StorageConfig};
use std::sync::Arc;
use tracing::info;

/// Which database a [`Storage`] is built on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProfile {
    /// SQLite file (or any `sqlite:` URL).
    Sqlite {
        database_url: String,
        max_connections: Option<u32>,
    },
    /// PostgreSQL, available with the `postgres` feature.
    Postgres {
        database_url: String,
        max_connections: Option<u32>,
    },
    /// Private in-memory SQLite database, used by tests.
    Memory,
}

impl StorageProfile {
    /// Select a profile from the `storage` configuration section.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.backend.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite {
                database_url: config.database_url.clone(),
                max_connections: config.max_connections,
            }),
            "postgres" | "postgresql" => Ok(Self::Postgres {
                database_url: config.database_url.clone(),
                max_connections: config.max_connections,
            }),
            "memory" => Ok(Self::Memory),
            other => Err(RunscopeError::Config(format!(
                "Unknown storage backend '{other}' (expected sqlite, postgres or memory)"
            ))),
        }
    }

    /// Open the adapter for this profile.
    pub async fn connect(&self) -> Result<Arc<dyn StorageAdapter>> {
        match self {
            Self::Sqlite {
                database_url,
                max_connections,
            } => Ok(Arc::new(
                SqliteAdapter::connect(database_url, *max_connections).await?,
            )),
            Self::Memory => Ok(Arc::new(SqliteAdapter::connect("sqlite::memory:", None).await?)),
            #[cfg(feature = "postgres")]
            Self::Postgres {
                database_url,
                max_connections,
            } => Ok(Arc::new(
                PostgresAdapter::connect(database_url, *max_connections).await?,
            )),
            #[cfg(not(feature = "postgres"))]
            Self::Postgres { .. } => Err(RunscopeError::Config(
                "PostgreSQL support requires the `postgres` feature".to_string(),
            )),
        }
    }

    /// Connect, create the schema and wire every repository with default
    /// statistics settings.
    pub async fn build(&self) -> Result<Storage> {
        let adapter = self.connect().await?;
        initialize_schema(adapter.as_ref()).await?;
        Ok(Storage::new(adapter, StatsConfig::default()))
    }
}

/// Every repository over one shared adapter.
#[derive(Clone)]
pub struct Storage {
    pub adapter: Arc<dyn StorageAdapter>,
    pub runs: RunRepository,
    pub systems: SystemRepository,
    pub traces: TraceRepository,
    pub feedback: FeedbackRepository,
    pub attachments: AttachmentRepository,
    pub stats: RunStatsRepository,
}

impl Storage {
    pub fn new(adapter: Arc<dyn StorageAdapter>, stats: StatsConfig) -> Self {
        let systems = SystemRepository::new(Arc::clone(&adapter));
        Self {
            runs: RunRepository::new(Arc::clone(&adapter), systems.clone()),
            traces: TraceRepository::new(Arc::clone(&adapter)),
            feedback: FeedbackRepository::new(Arc::clone(&adapter)),
            attachments: AttachmentRepository::new(Arc::clone(&adapter)),
            stats: RunStatsRepository::new(Arc::clone(&adapter), stats),
            systems,
            adapter,
        }
    }

    /// Build storage from the `storage` and `stats` configuration sections.
    pub async fn open(storage: &StorageConfig, stats: &StatsConfig) -> Result<Self> {
        let profile = StorageProfile::from_config(storage)?;
        let adapter = profile.connect().await?;
        if storage.auto_init_schema {
            initialize_schema(adapter.as_ref()).await?;
        }
        info!(backend = adapter.backend_name(), "Storage ready");
        Ok(Self::new(adapter, stats.clone()))
    }

    /// Release pooled connections.
    pub async fn close(&self) {
        self.adapter.close().await;
    }
}
