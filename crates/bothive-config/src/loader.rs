use std::path::{Path, PathBuf};
use std::str::FromStr;

use bothive_common::{Error, Result};
use tracing::{debug, info};

use crate::model::{LedgerKind, MigrateConfig};

/// Builds a [`MigrateConfig`] from defaults, an optional config file, a
/// `.env` file and `BOTHIVE_*` environment variables, in that order.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(config_path: Option<&Path>) -> Result<MigrateConfig> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => MigrateConfig::default(),
        };

        match dotenvy::dotenv() {
            Ok(path) => debug!("loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(Error::Config(format!(".env parse error: {e}"))),
        }

        Self::apply_env(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<MigrateConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("config loaded from {}", path.display());
        Ok(config)
    }

    /// Overlay `BOTHIVE_*` variables resolved through `lookup`.
    pub fn apply_env<F>(config: &mut MigrateConfig, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("BOTHIVE_MIGRATIONS_DIR") {
            config.migrations_dir = PathBuf::from(v);
        }
        if let Some(v) = var("BOTHIVE_DB_PATH") {
            config.database.path = PathBuf::from(v);
        }
        if let Some(v) = var("BOTHIVE_DB_BUSY_TIMEOUT_MS") {
            config.database.busy_timeout_ms = parse_env("BOTHIVE_DB_BUSY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("BOTHIVE_LEDGER") {
            config.ledger.kind = LedgerKind::from_str(&v)?;
        }
        if let Some(v) = var("BOTHIVE_LEDGER_PATH") {
            config.ledger.path = PathBuf::from(v);
        }
        if let Some(v) = var("BOTHIVE_DB_CONNECT_ATTEMPTS") {
            config.readiness.max_attempts = parse_env("BOTHIVE_DB_CONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("BOTHIVE_DB_CONNECT_INTERVAL_MS") {
            config.readiness.interval_ms = parse_env("BOTHIVE_DB_CONNECT_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("BOTHIVE_LOCK_LEASE_SECS") {
            config.lock.lease_secs = parse_env("BOTHIVE_LOCK_LEASE_SECS", &v)?;
        }
        if let Some(v) = var("BOTHIVE_VERIFY_CHECKSUMS") {
            config.verify_checksums = parse_bool("BOTHIVE_VERIFY_CHECKSUMS", &v)?;
        }
        if let Some(v) = var("BOTHIVE_LOG_JSON") {
            config.log_json = parse_bool("BOTHIVE_LOG_JSON", &v)?;
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| Error::Config(format!("invalid value for {key}: '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        _ => Err(Error::Config(format!("invalid value for {key}: '{value}'"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_overrides_defaults() {
        let vars = env(&[
            ("BOTHIVE_MIGRATIONS_DIR", "/app/migrations"),
            ("BOTHIVE_DB_PATH", "/data/bot.db"),
            ("BOTHIVE_LEDGER", "file"),
            ("BOTHIVE_LEDGER_PATH", "/data/.migrations"),
            ("BOTHIVE_DB_CONNECT_ATTEMPTS", "5"),
            ("BOTHIVE_VERIFY_CHECKSUMS", "no"),
        ]);
        let mut config = MigrateConfig::default();
        ConfigLoader::apply_env(&mut config, |k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.migrations_dir, PathBuf::from("/app/migrations"));
        assert_eq!(config.database.path, PathBuf::from("/data/bot.db"));
        assert_eq!(config.ledger.kind, LedgerKind::File);
        assert_eq!(config.ledger.path, PathBuf::from("/data/.migrations"));
        assert_eq!(config.readiness.max_attempts, 5);
        assert!(!config.verify_checksums);
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let vars = env(&[("BOTHIVE_DB_PATH", "  ")]);
        let mut config = MigrateConfig::default();
        ConfigLoader::apply_env(&mut config, |k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.database.path, PathBuf::from("data/bothive.db"));
    }

    #[test]
    fn invalid_env_number_is_an_error() {
        let vars = env(&[("BOTHIVE_DB_CONNECT_ATTEMPTS", "forever")]);
        let mut config = MigrateConfig::default();
        let err = ConfigLoader::apply_env(&mut config, |k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("BOTHIVE_DB_CONNECT_ATTEMPTS"));
    }

    #[test]
    fn loads_yaml_and_toml_files() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("migrate.yml");
        std::fs::write(&yaml, "migrations_dir: sql\nlog_json: true\n").unwrap();
        let config = ConfigLoader::from_file(&yaml).unwrap();
        assert_eq!(config.migrations_dir, PathBuf::from("sql"));
        assert!(config.log_json);

        let toml_path = dir.path().join("migrate.toml");
        std::fs::write(&toml_path, "[lock]\nlease_secs = 60\n").unwrap();
        let config = ConfigLoader::from_file(&toml_path).unwrap();
        assert_eq!(config.lock.lease_secs, 60);
    }

    #[test]
    fn rejects_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrate.ini");
        std::fs::write(&path, "x=1").unwrap();
        let err = ConfigLoader::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config extension"));
    }
}
