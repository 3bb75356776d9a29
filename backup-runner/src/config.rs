//! Configuration management for the backup runner.
//!
//! Loads configuration from an optional TOML file, then applies environment
//! variable overrides (a `.env` file is honoured). Missing keys fall back to
//! defaults.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the `database/` and `volume/` partitions
    #[serde(default = "default_backup_root_path")]
    pub backup_root_path: PathBuf,

    /// Backup sets older than this many days are pruned
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default)]
    pub database_identity: DatabaseIdentity,

    /// Live data directory archived by the volume task
    #[serde(default = "default_volume_source_path")]
    pub volume_source_path: PathBuf,

    #[serde(default)]
    pub dump: DumpConfig,

    #[serde(default)]
    pub volume: VolumeConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Addressing of the database to dump. Authentication is whatever the
/// invoking user already has configured for the dump tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseIdentity {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_user")]
    pub user: String,

    #[serde(default = "default_db_name")]
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Argv template; `{host}`, `{user}` and `{database}` are substituted
    #[serde(default = "default_dump_command")]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// File-name substrings skipped while archiving
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Per-step timeout in seconds (unset = wait forever)
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,

    /// Hold an exclusive lock on the backup root for the whole run
    #[serde(default = "default_lock")]
    pub lock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_backup_root_path() -> PathBuf {
    PathBuf::from("/srv/backups")
}

fn default_retention_days() -> u32 {
    7
}

fn default_volume_source_path() -> PathBuf {
    PathBuf::from("/srv/data")
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_db_name() -> String {
    "postgres".to_string()
}

fn default_dump_command() -> Vec<String> {
    ["pg_dump", "-h", "{host}", "-U", "{user}", "{database}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_lock() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseIdentity {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            user: default_db_user(),
            database: default_db_name(),
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            command: default_dump_command(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: None,
            lock: default_lock(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backup_root_path: default_backup_root_path(),
            retention_days: default_retention_days(),
            database_identity: DatabaseIdentity::default(),
            volume_source_path: default_volume_source_path(),
            dump: DumpConfig::default(),
            volume: VolumeConfig::default(),
            run: RunConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BackupError::io_at(path, e))?;
        toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))
    }

    /// File (if any), then `.env` and process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BACKUP_ROOT_PATH") {
            self.backup_root_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("RETENTION_DAYS") {
            self.retention_days = v
                .parse()
                .map_err(|_| BackupError::Config(format!("RETENTION_DAYS is not a number: {v}")))?;
        }
        if let Some(v) = lookup("DB_HOST") {
            self.database_identity.host = v;
        }
        if let Some(v) = lookup("DB_USER") {
            self.database_identity.user = v;
        }
        if let Some(v) = lookup("DB_NAME") {
            self.database_identity.database = v;
        }
        if let Some(v) = lookup("VOLUME_SOURCE_PATH") {
            self.volume_source_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("STEP_TIMEOUT_SECS") {
            let secs = v.parse().map_err(|_| {
                BackupError::Config(format!("STEP_TIMEOUT_SECS is not a number: {v}"))
            })?;
            self.run.step_timeout_secs = Some(secs);
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backup_root_path.is_absolute() {
            return Err(BackupError::Config(format!(
                "backup_root_path must be absolute: {}",
                self.backup_root_path.display()
            )));
        }
        if !self.volume_source_path.is_absolute() {
            return Err(BackupError::Config(format!(
                "volume_source_path must be absolute: {}",
                self.volume_source_path.display()
            )));
        }
        if self.database_identity.database.is_empty() {
            return Err(BackupError::Config("database_identity.database is empty".into()));
        }
        if self.dump.command.is_empty() {
            return Err(BackupError::Config("dump.command is empty".into()));
        }
        if self.run.step_timeout_secs == Some(0) {
            return Err(BackupError::Config("run.step_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.run.step_timeout_secs.map(Duration::from_secs)
    }

    /// Dump argv with the database identity substituted.
    pub fn dump_argv(&self) -> Vec<String> {
        let id = &self.database_identity;
        self.dump
            .command
            .iter()
            .map(|arg| {
                arg.replace("{host}", &id.host)
                    .replace("{user}", &id.user)
                    .replace("{database}", &id.database)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retention_days, 7);
        assert!(config.run.lock);
        assert!(config.run.step_timeout_secs.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(
            config.dump_argv(),
            vec!["pg_dump", "-h", "localhost", "-U", "postgres", "postgres"]
        );
    }

    #[test]
    fn test_from_file_partial() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("backup.toml");
        std::fs::write(
            &path,
            r#"
backup_root_path = "/mnt/backups"
volume_source_path = "/var/lib/app"

[database_identity]
host = "db"
user = "app"
database = "inventory"
"#,
        )?;

        let config = Config::from_file(&path)?;
        assert_eq!(config.backup_root_path, PathBuf::from("/mnt/backups"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.database_identity.database, "inventory");
        assert_eq!(config.dump_argv()[2], "db");
        assert_eq!(config.dump_argv()[5], "inventory");
        Ok(())
    }

    #[test]
    fn test_malformed_file_is_config_error() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("backup.toml");
        std::fs::write(&path, "retention_days = \"seven\"")?;

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
        Ok(())
    }

    #[test]
    fn test_overrides() -> Result<()> {
        let env: HashMap<&str, &str> = [
            ("BACKUP_ROOT_PATH", "/data/backups"),
            ("RETENTION_DAYS", "14"),
            ("DB_NAME", "ledger"),
            ("STEP_TIMEOUT_SECS", "600"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()))?;

        assert_eq!(config.backup_root_path, PathBuf::from("/data/backups"));
        assert_eq!(config.retention_days, 14);
        assert_eq!(config.database_identity.database, "ledger");
        assert_eq!(config.step_timeout(), Some(Duration::from_secs(600)));
        Ok(())
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut config = Config::default();
        let result = config.apply_overrides(|k| (k == "RETENTION_DAYS").then(|| "week".to_string()));
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_relative_paths_rejected() {
        let mut config = Config::default();
        config.volume_source_path = PathBuf::from("data");
        assert!(matches!(config.validate(), Err(BackupError::Config(_))));
    }
}
