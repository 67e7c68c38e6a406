//! YAML configuration loading for the `runscope` binary.
//!
//! Loads [`RunscopeConfig`] from a YAML file on disk, falling back to
//! defaults when no file is specified.

use runscope_core::RunscopeConfig;
use runscope_storage::StorageProfile;
use std::path::Path;

/// Load a [`RunscopeConfig`] from a YAML file at `path` and validate it.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML is invalid, or a
/// value is out of range.
pub fn load_config(path: &Path) -> anyhow::Result<RunscopeConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let config: RunscopeConfig = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {}", e))?;
    validate(&config)?;
    Ok(config)
}

/// Reject settings that would only fail later, at first use.
pub fn validate(config: &RunscopeConfig) -> anyhow::Result<()> {
    StorageProfile::from_config(&config.storage)?;
    if config.stats.hour_check_concurrency == 0 {
        anyhow::bail!("stats.hour_check_concurrency must be at least 1");
    }
    if config.stats.max_window_hours == 0 {
        anyhow::bail!("stats.max_window_hours must be at least 1");
    }
    if !matches!(config.logging.format.as_str(), "text" | "json") {
        anyhow::bail!(
            "logging.format must be 'text' or 'json', got '{}'",
            config.logging.format
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_yaml(yaml: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_config_full() {
        let yaml = r#"
storage:
  backend: postgres
  database_url: "postgres://runscope:secret@db/runscope"
  max_connections: 20
  auto_init_schema: false
stats:
  hour_check_concurrency: 4
  recompute_open_hours: true
  max_window_hours: 168
logging:
  level: debug
  format: json
"#;
        let f = write_yaml(yaml);
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.storage.backend, "postgres");
        assert_eq!(config.storage.max_connections, Some(20));
        assert!(!config.storage.auto_init_schema);
        assert_eq!(config.stats.hour_check_concurrency, 4);
        assert!(config.stats.recompute_open_hours);
        assert_eq!(config.stats.max_window_hours, 168);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_load_config_partial_uses_defaults() {
        let f = write_yaml("storage:\n  database_url: \"sqlite:///var/lib/runscope.db\"\n");
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.storage.backend, "sqlite");
        assert_eq!(config.storage.database_url, "sqlite:///var/lib/runscope.db");
        assert!(config.storage.auto_init_schema);
        assert_eq!(config.stats.hour_check_concurrency, 8);
        assert!(!config.stats.recompute_open_hours);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/runscope.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let f = write_yaml("storage: [not, a, map");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let f = write_yaml("storage:\n  backend: mongo\n");
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("mongo"));

        let f = write_yaml("stats:\n  hour_check_concurrency: 0\n");
        assert!(load_config(f.path()).is_err());

        let f = write_yaml("stats:\n  max_window_hours: 0\n");
        assert!(load_config(f.path()).is_err());

        let f = write_yaml("logging:\n  format: xml\n");
        assert!(load_config(f.path()).is_err());
    }
}
