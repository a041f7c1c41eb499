use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bothive_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the migration runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    pub migrations_dir: PathBuf,
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub readiness: ReadinessConfig,
    pub lock: LockConfig,
    /// Refuse to run when an applied migration's body no longer matches the
    /// checksum recorded when it was applied.
    pub verify_checksums: bool,
    pub log_json: bool,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            database: DatabaseConfig::default(),
            ledger: LedgerConfig::default(),
            readiness: ReadinessConfig::default(),
            lock: LockConfig::default(),
            verify_checksums: true,
            log_json: false,
        }
    }
}

impl MigrateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.migrations_dir.as_os_str().is_empty() {
            return Err(Error::Config("migrations_dir cannot be empty".into()));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(Error::Config("database.path cannot be empty".into()));
        }
        if self.ledger.kind == LedgerKind::File && self.ledger.path.as_os_str().is_empty() {
            return Err(Error::Config(
                "ledger.path is required for the file ledger".into(),
            ));
        }
        if self.readiness.max_attempts == 0 {
            return Err(Error::Config(
                "readiness.max_attempts must be at least 1".into(),
            ));
        }
        if self.lock.lease_secs == 0 {
            return Err(Error::Config("lock.lease_secs must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file of the target database.
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/bothive.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Where the record of applied migrations lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    /// A table inside the target database.
    #[default]
    Database,
    /// A JSON-lines file on a persisted volume.
    File,
}

impl FromStr for LedgerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(LedgerKind::Database),
            "file" => Ok(LedgerKind::File),
            other => Err(Error::Config(format!(
                "unknown ledger kind '{other}' (expected 'database' or 'file')"
            ))),
        }
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerKind::Database => f.write_str("database"),
            LedgerKind::File => f.write_str("file"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub kind: LedgerKind,
    /// Only used by the file ledger.
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            kind: LedgerKind::Database,
            path: PathBuf::from("data/migrations.ledger"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval_ms: 1_000,
        }
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// A lock older than this is treated as abandoned by a crashed runner.
    pub lease_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { lease_secs: 300 }
    }
}

impl LockConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MigrateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ledger.kind, LedgerKind::Database);
        assert!(config.verify_checksums);
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut config = MigrateConfig::default();
        config.readiness.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn validate_rejects_empty_ledger_path_for_file_ledger() {
        let mut config = MigrateConfig::default();
        config.ledger.kind = LedgerKind::File;
        config.ledger.path = PathBuf::new();
        assert!(config.validate().is_err());

        config.ledger.kind = LedgerKind::Database;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ledger_kind_parses_case_insensitively() {
        assert_eq!("FILE".parse::<LedgerKind>().unwrap(), LedgerKind::File);
        assert_eq!("db".parse::<LedgerKind>().unwrap(), LedgerKind::Database);
        assert!("redis".parse::<LedgerKind>().is_err());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: MigrateConfig = serde_yaml::from_str(
            "ledger:\n  kind: file\nreadiness:\n  max_attempts: 5\n",
        )
        .unwrap();
        assert_eq!(config.ledger.kind, LedgerKind::File);
        assert_eq!(config.readiness.max_attempts, 5);
        assert_eq!(config.readiness.interval_ms, 1_000);
        assert_eq!(config.database.busy_timeout_ms, 5_000);
    }
}
