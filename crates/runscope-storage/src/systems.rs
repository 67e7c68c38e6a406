//! System (tenant) repository.
//!
//! Systems are referenced from runs by name only. Ingestion never rejects a
//! run for an unknown system: [`SystemRepository::ensure_system_exists`]
//! creates it on first sight, and the consistency utilities at the bottom of
//! this module repair or report any names that slipped through.

use rand::RngCore;
use runscope_core::{now_iso, Result, RunscopeError, System, SystemStats, SystemStatus, SystemUpdate};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapter::{Row, SqlValue, StorageAdapter};
use crate::convert::parse_datetime;

/// Prefix of every issued API key.
const KEY_PREFIX: &str = "sk-";

/// Random bytes per key (hex-encoded to 32 characters).
const KEY_RANDOM_BYTES: usize = 16;

const SYSTEM_COLUMNS: &str = "id, name, description, api_key, status, created_at, updated_at";

/// Generate a fresh API key of the form `sk-<32 hex chars>`.
pub fn generate_api_key() -> String {
    let mut random_bytes = [0u8; KEY_RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    format!("{KEY_PREFIX}{}", hex::encode(random_bytes))
}

fn system_from_row(row: &Row) -> Result<System> {
    Ok(System {
        id: row.required_text("id")?,
        name: row.required_text("name")?,
        description: row.text("description"),
        api_key: row.required_text("api_key")?,
        status: row
            .text("status")
            .as_deref()
            .unwrap_or("active")
            .parse()?,
        created_at: parse_datetime(&row.required_text("created_at")?)?,
        updated_at: parse_datetime(&row.required_text("updated_at")?)?,
    })
}

/// CRUD, API-key issuance and usage statistics for systems.
#[derive(Clone)]
pub struct SystemRepository {
    adapter: Arc<dyn StorageAdapter>,
}

impl SystemRepository {
    /// Create a repository over `adapter`.
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    // -- CRUD ---------------------------------------------------------------

    /// Create a system with a freshly issued API key.
    pub async fn create_system(&self, name: &str, description: Option<&str>) -> Result<System> {
        let adapter = self.adapter.as_ref();
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        let mut params = adapter.params();
        let sql = format!(
            "INSERT INTO systems ({SYSTEM_COLUMNS}) VALUES ({})",
            params.push_all([
                SqlValue::from(&id),
                SqlValue::from(name),
                SqlValue::from(description),
                SqlValue::from(generate_api_key()),
                SqlValue::from(SystemStatus::Active.to_string()),
                SqlValue::from(&now),
                SqlValue::from(&now),
            ])
        );
        adapter.run(&sql, params.values()).await?;
        info!(system = name, "System created");

        self.get_system(&id)
            .await?
            .ok_or_else(|| RunscopeError::Storage(format!("System '{name}' vanished after insert")))
    }

    /// Look up a system by id.
    pub async fn get_system(&self, id: &str) -> Result<Option<System>> {
        self.get_one("id", id).await
    }

    /// Look up a system by its unique name.
    pub async fn get_system_by_name(&self, name: &str) -> Result<Option<System>> {
        self.get_one("name", name).await
    }

    /// Look up a system by API key.
    pub async fn get_system_by_api_key(&self, api_key: &str) -> Result<Option<System>> {
        self.get_one("api_key", api_key).await
    }

    async fn get_one(&self, column: &str, value: &str) -> Result<Option<System>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!(
            "SELECT {SYSTEM_COLUMNS} FROM systems WHERE {column} = {}",
            params.push(value)
        );
        adapter
            .get(&sql, params.values())
            .await?
            .as_ref()
            .map(system_from_row)
            .transpose()
    }

    /// Every system, ordered by name.
    pub async fn list_systems(&self) -> Result<Vec<System>> {
        let sql = format!("SELECT {SYSTEM_COLUMNS} FROM systems ORDER BY name");
        let rows = self.adapter.all(&sql, &[]).await?;
        rows.iter().map(system_from_row).collect()
    }

    /// Apply a partial update. Returns `None` when no system has this id.
    pub async fn update_system(&self, id: &str, update: &SystemUpdate) -> Result<Option<System>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let mut sets = Vec::new();
        if let Some(name) = &update.name {
            sets.push(format!("name = {}", params.push(name)));
        }
        if let Some(description) = &update.description {
            sets.push(format!("description = {}", params.push(description)));
        }
        if let Some(status) = update.status {
            sets.push(format!("status = {}", params.push(status.to_string())));
        }
        sets.push(format!("updated_at = {}", params.push(now_iso())));

        let sql = format!(
            "UPDATE systems SET {} WHERE id = {}",
            sets.join(", "),
            params.push(id)
        );
        let result = adapter.run(&sql, params.values()).await?;
        if result.changes == 0 {
            return Ok(None);
        }
        self.get_system(id).await
    }

    /// Delete a system. Runs keep their `system` value. Returns whether a row was removed.
    pub async fn delete_system(&self, id: &str) -> Result<bool> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!("DELETE FROM systems WHERE id = {}", params.push(id));
        let result = adapter.run(&sql, params.values()).await?;
        Ok(result.changes > 0)
    }

    // -- Ingestion helpers --------------------------------------------------

    /// Get the system named `name`, creating it when it does not exist yet.
    ///
    /// Concurrent callers racing on the same new name both end up with the
    /// single row that won the insert.
    pub async fn ensure_system_exists(&self, name: &str) -> Result<System> {
        if let Some(existing) = self.get_system_by_name(name).await? {
            return Ok(existing);
        }

        let (sql, params) = self.auto_create_statement(name);
        let result = self.adapter.run(&sql, &params).await?;
        if result.changes > 0 {
            info!(system = name, "System auto-created");
        }

        self.get_system_by_name(name)
            .await?
            .ok_or_else(|| RunscopeError::Storage(format!("System '{name}' missing after ensure")))
    }

    /// Insert-if-absent statement for an auto-created system, for callers
    /// that run it inside their own transaction.
    pub(crate) fn auto_create_statement(&self, name: &str) -> (String, Vec<SqlValue>) {
        let now = now_iso();
        let mut params = self.adapter.as_ref().params();
        let values = params.push_all([
            SqlValue::from(Uuid::new_v4().to_string()),
            SqlValue::from(name),
            SqlValue::from(format!("Auto-created from run data for {name}")),
            SqlValue::from(generate_api_key()),
            SqlValue::from(SystemStatus::Active.to_string()),
            SqlValue::from(&now),
            SqlValue::from(&now),
        ]);
        let sql = format!(
            "INSERT INTO systems ({SYSTEM_COLUMNS}) VALUES ({values}) ON CONFLICT (name) DO NOTHING"
        );
        (sql, params.into_values())
    }

    /// Issue a new API key, overwriting the old one. Returns `None` for an unknown id.
    pub async fn regenerate_api_key(&self, id: &str) -> Result<Option<System>> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let sql = format!(
            "UPDATE systems SET api_key = {}, updated_at = {} WHERE id = {}",
            params.push(generate_api_key()),
            params.push(now_iso()),
            params.push(id)
        );
        let result = adapter.run(&sql, params.values()).await?;
        if result.changes == 0 {
            return Ok(None);
        }
        debug!(system_id = id, "API key regenerated");
        self.get_system(id).await
    }

    // -- Statistics ---------------------------------------------------------

    /// Usage totals for the runs reported under `name`.
    pub async fn get_system_stats(&self, name: &str) -> Result<SystemStats> {
        let adapter = self.adapter.as_ref();
        let mut params = adapter.params();
        let feedback_name = params.push(name);
        let attachment_name = params.push(name);
        let run_name = params.push(name);
        let sql = format!(
            "SELECT
                COUNT(*) AS total_runs,
                COUNT(DISTINCT trace_id) AS total_traces,
                CAST(COALESCE(SUM(total_tokens), 0) AS BIGINT) AS total_tokens,
                (SELECT COUNT(*) FROM feedback f JOIN runs r ON f.run_id = r.id
                    WHERE r.system = {feedback_name}) AS total_feedback,
                (SELECT COUNT(*) FROM attachments a JOIN runs r ON a.run_id = r.id
                    WHERE r.system = {attachment_name}) AS total_attachments
             FROM runs WHERE system = {run_name}"
        );
        let row = adapter.get(&sql, params.values()).await?;
        let count = |column: &str| row.as_ref().and_then(|r| r.int(column)).unwrap_or(0);
        Ok(SystemStats {
            system: name.to_string(),
            total_runs: count("total_runs"),
            total_traces: count("total_traces"),
            total_tokens: count("total_tokens"),
            total_feedback: count("total_feedback"),
            total_attachments: count("total_attachments"),
        })
    }

    // -- Consistency utilities ----------------------------------------------

    /// System names seen on runs that have no system row.
    pub async fn validate_system_references(&self) -> Result<Vec<String>> {
        let rows = self
            .adapter
            .all(
                "SELECT DISTINCT r.system AS name
                 FROM runs r
                 LEFT JOIN systems s ON s.name = r.system
                 WHERE r.system IS NOT NULL AND r.system <> '' AND s.id IS NULL
                 ORDER BY r.system",
                &[],
            )
            .await?;
        Ok(rows.iter().filter_map(|r| r.text("name")).collect())
    }

    /// Create a system row for every orphan name found on runs. Returns the created names.
    pub async fn migrate_existing_runs_to_systems(&self) -> Result<Vec<String>> {
        let orphans = self.validate_system_references().await?;
        for name in &orphans {
            self.ensure_system_exists(name).await?;
        }
        info!(created = orphans.len(), "Backfilled systems from runs");
        Ok(orphans)
    }
}
