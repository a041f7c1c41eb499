use std::path::PathBuf;

use bothive_common::Result;
use bothive_config::{LedgerKind, MigrateConfig};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "bothive-migrate",
    version,
    about = "Apply pending BotHive Plus schema migrations"
)]
pub struct Cli {
    /// YAML or TOML config file.
    #[arg(long, env = "BOTHIVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the `.sql` migration files.
    #[arg(long)]
    pub migrations_dir: Option<PathBuf>,

    /// Target SQLite database file.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Record store: `database` or `file`.
    #[arg(long)]
    pub ledger: Option<String>,

    /// Ledger file used by the `file` record store.
    #[arg(long)]
    pub ledger_path: Option<PathBuf>,

    /// Apply even if an applied migration's file has changed.
    #[arg(long)]
    pub allow_drift: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Apply every migration that has not been applied yet (default).
    Apply,
    /// Show applied, pending and drifted migrations without changing anything.
    Status {
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Apply)
    }

    /// Flags take precedence over the config file and environment.
    pub fn apply_overrides(&self, config: &mut MigrateConfig) -> Result<()> {
        if let Some(dir) = &self.migrations_dir {
            config.migrations_dir = dir.clone();
        }
        if let Some(db) = &self.db {
            config.database.path = db.clone();
        }
        if let Some(kind) = &self.ledger {
            config.ledger.kind = kind.parse::<LedgerKind>()?;
        }
        if let Some(path) = &self.ledger_path {
            config.ledger.path = path.clone();
        }
        if self.allow_drift {
            config.verify_checksums = false;
        }
        if self.log_json {
            config.log_json = true;
        }
        Ok(())
    }
}
