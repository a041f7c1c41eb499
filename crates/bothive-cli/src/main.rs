mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use bothive_config::{ConfigLoader, LedgerKind, MigrateConfig};
use bothive_db::{
    DatabaseLedger, FileLedger, MigrationApplicator, MigrationState, RecordStore, RetryPolicy,
    SqliteDatabase, TargetDatabase, discover_migrations, wait_until_reachable,
};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bothive-migrate: {e}");
            return ExitCode::from(e.exit_code());
        }
    };
    init_tracing(config.log_json);

    match run(cli.command(), config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("bothive-migrate: {e:#}");
            let code = e
                .downcast_ref::<bothive_common::Error>()
                .map(bothive_common::Error::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn load_config(cli: &Cli) -> bothive_common::Result<MigrateConfig> {
    let mut config = ConfigLoader::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(command: Command, config: MigrateConfig) -> Result<()> {
    // Discovery failures abort before the database is contacted.
    let definitions = discover_migrations(&config.migrations_dir)?;
    info!(
        "found {} migration(s) in {}",
        definitions.len(),
        config.migrations_dir.display()
    );

    // `status` never writes, so it must not create the file or switch its journal.
    let read_only = matches!(command, Command::Status { .. });
    let db = Arc::new(connect(&config, read_only).await?);
    let ledger: Arc<dyn RecordStore> = match config.ledger.kind {
        LedgerKind::Database => Arc::new(DatabaseLedger::new(db.clone())),
        LedgerKind::File => Arc::new(FileLedger::open(&config.ledger.path)?),
    };
    info!("using {} ledger", config.ledger.kind);

    let applicator = MigrationApplicator::new(&config.migrations_dir, db, ledger)
        .verify_checksums(config.verify_checksums)
        .lock_lease(config.lock.lease());

    match command {
        Command::Apply => {
            let report =
                tokio::task::spawn_blocking(move || applicator.apply_definitions(&definitions))
                    .await
                    .context("migration task panicked")??;
            println!(
                "applied {}, skipped {}",
                report.applied_names.len(),
                report.skipped_names.len()
            );
        }
        Command::Status { json } => {
            let statuses = applicator.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                for status in &statuses {
                    let state = match &status.state {
                        MigrationState::Pending => "pending".to_string(),
                        MigrationState::Applied { applied_at } => {
                            format!("applied  {}", applied_at.to_rfc3339())
                        }
                        MigrationState::Drifted { applied_at, .. } => {
                            format!("DRIFTED  {} (file changed since)", applied_at.to_rfc3339())
                        }
                        MigrationState::Orphaned { applied_at } => {
                            format!("orphaned {} (file missing)", applied_at.to_rfc3339())
                        }
                    };
                    println!("{:<40} {state}", status.name);
                }
            }
        }
    }

    Ok(())
}

async fn connect(
    config: &MigrateConfig,
    read_only: bool,
) -> bothive_common::Result<SqliteDatabase> {
    let policy = RetryPolicy::new(
        config.readiness.max_attempts,
        config.readiness.interval(),
    );
    let path = config.database.path.clone();
    let busy_timeout = config.database.busy_timeout();

    info!("waiting for database at {}", path.display());
    wait_until_reachable(policy, || {
        let db = if read_only {
            SqliteDatabase::open_read_only(&path, busy_timeout)?
        } else {
            SqliteDatabase::open(&path, busy_timeout)?
        };
        db.ping()?;
        Ok(db)
    })
    .await
}
