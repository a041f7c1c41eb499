use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bothive_common::{Error, Result};
use bothive_config::LockConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::TargetDatabase;
use crate::ledger::{MigrationRecord, RecordStore};
use crate::migrations::{MigrationDefinition, discover_migrations};

/// Outcome of [`MigrationApplicator::apply_pending`], in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppliedReport {
    pub applied_names: Vec<String>,
    pub skipped_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub name: String,
    pub state: MigrationState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    Pending,
    Applied {
        applied_at: DateTime<Utc>,
    },
    /// Applied, but the file changed since.
    Drifted {
        applied_at: DateTime<Utc>,
        recorded: String,
        current: String,
    },
    /// Recorded as applied but no longer present in the migration source.
    Orphaned {
        applied_at: DateTime<Utc>,
    },
}

/// Applies pending migrations from a source directory to a target database,
/// in name order, recording each success before moving to the next.
pub struct MigrationApplicator {
    source_dir: PathBuf,
    target: Arc<dyn TargetDatabase>,
    ledger: Arc<dyn RecordStore>,
    verify_checksums: bool,
    lock_lease: Duration,
}

impl MigrationApplicator {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        target: Arc<dyn TargetDatabase>,
        ledger: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            target,
            ledger,
            verify_checksums: true,
            lock_lease: LockConfig::default().lease(),
        }
    }

    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn discover(&self) -> Result<Vec<MigrationDefinition>> {
        discover_migrations(&self.source_dir)
    }

    pub fn is_applied(&self, name: &str) -> Result<bool> {
        self.ledger.is_applied(name)
    }

    /// Apply a single migration and record it. On failure nothing is
    /// recorded and the migration stays pending.
    pub fn apply_one(&self, definition: &MigrationDefinition) -> Result<()> {
        let started = Instant::now();
        let record = MigrationRecord::applied(&definition.name, Some(definition.checksum.clone()));

        if self.ledger.shares_target_transaction() {
            self.target.execute_migration(definition, Some(&record))?;
        } else {
            self.target.execute_migration(definition, None)?;
            self.ledger.record_applied(&record)?;
        }

        info!(
            migration = %definition.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "applied"
        );
        Ok(())
    }

    /// Discover migrations and apply every one not yet recorded.
    pub fn apply_pending(&self) -> Result<AppliedReport> {
        let definitions = self.discover()?;
        self.apply_definitions(&definitions)
    }

    /// Apply the not-yet-recorded entries of an already discovered, name
    /// ordered migration list. Stops at the first failure.
    pub fn apply_definitions(&self, definitions: &[MigrationDefinition]) -> Result<AppliedReport> {
        ensure_strictly_ordered(definitions)?;

        let holder = Uuid::new_v4().to_string();
        if !self.target.try_acquire_lock(&holder, self.lock_lease)? {
            return Err(Error::Lock(
                "another runner holds the migration lock; retry once it finishes".into(),
            ));
        }

        let result = self.apply_locked(&holder, definitions);

        if let Err(e) = self.target.release_lock(&holder) {
            warn!("failed to release migration lock (it expires with its lease): {e}");
        }
        result
    }

    fn apply_locked(
        &self,
        holder: &str,
        definitions: &[MigrationDefinition],
    ) -> Result<AppliedReport> {
        let records: HashMap<String, MigrationRecord> = self
            .ledger
            .load()?
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();

        if self.verify_checksums {
            for definition in definitions {
                if let Some(recorded) = drift(definition, records.get(&definition.name)) {
                    error!(migration = %definition.name, "applied migration was modified");
                    return Err(Error::ChecksumMismatch {
                        name: definition.name.clone(),
                        recorded: recorded.to_string(),
                        current: definition.checksum.clone(),
                    });
                }
            }
        }

        let mut report = AppliedReport::default();
        for definition in definitions {
            if records.contains_key(&definition.name) {
                info!(migration = %definition.name, "already applied, skipping");
                report.skipped_names.push(definition.name.clone());
                continue;
            }

            self.renew_lock(holder)?;
            if let Err(e) = self.apply_one(definition) {
                error!(migration = %definition.name, "migration failed: {e}");
                return Err(e);
            }
            report.applied_names.push(definition.name.clone());
        }

        info!(
            applied = report.applied_names.len(),
            skipped = report.skipped_names.len(),
            "migrations complete"
        );
        Ok(report)
    }

    // A lease that lapsed mid-run may already belong to another runner.
    fn renew_lock(&self, holder: &str) -> Result<()> {
        if self.target.renew_lock(holder, self.lock_lease)? {
            return Ok(());
        }
        error!("migration lock lost to another runner");
        Err(Error::Lock(format!(
            "migration lock expired and was taken over; lease of {}s is shorter than the run",
            self.lock_lease.as_secs()
        )))
    }

    /// Compare the migration source with the ledger without writing anything.
    pub fn status(&self) -> Result<Vec<MigrationStatus>> {
        let definitions = self.discover()?;
        let mut records: HashMap<String, MigrationRecord> = self
            .ledger
            .load()?
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();

        let mut statuses: Vec<MigrationStatus> = definitions
            .iter()
            .map(|definition| {
                let state = match records.remove(&definition.name) {
                    None => MigrationState::Pending,
                    Some(record) => match drift(definition, Some(&record)) {
                        Some(recorded) => MigrationState::Drifted {
                            applied_at: record.applied_at,
                            recorded: recorded.to_string(),
                            current: definition.checksum.clone(),
                        },
                        None => MigrationState::Applied {
                            applied_at: record.applied_at,
                        },
                    },
                };
                MigrationStatus {
                    name: definition.name.clone(),
                    state,
                }
            })
            .collect();

        statuses.extend(records.into_values().map(|record| MigrationStatus {
            name: record.name,
            state: MigrationState::Orphaned {
                applied_at: record.applied_at,
            },
        }));
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }
}

/// The recorded checksum, when it differs from the definition's current one.
fn drift<'a>(
    definition: &MigrationDefinition,
    record: Option<&'a MigrationRecord>,
) -> Option<&'a str> {
    let recorded = record?.checksum.as_deref()?;
    (recorded != definition.checksum).then_some(recorded)
}

fn ensure_strictly_ordered(definitions: &[MigrationDefinition]) -> Result<()> {
    for pair in definitions.windows(2) {
        if pair[0].name >= pair[1].name {
            return Err(Error::Discovery(format!(
                "migrations must be unique and sorted by name: {} precedes {}",
                pair[0].name, pair[1].name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteDatabase;
    use crate::ledger::{DatabaseLedger, FileLedger};

    fn write(dir: &Path, name: &str, sql: &str) {
        std::fs::write(dir.join(format!("{name}.sql")), sql).unwrap();
    }

    fn db_applicator(dir: &Path) -> (Arc<SqliteDatabase>, MigrationApplicator) {
        let db = Arc::new(SqliteDatabase::in_memory().unwrap());
        let ledger = Arc::new(DatabaseLedger::new(db.clone()));
        let applicator = MigrationApplicator::new(dir, db.clone(), ledger);
        (db, applicator)
    }

    #[test]
    fn applies_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001-init", "CREATE TABLE bots (id INTEGER PRIMARY KEY);");
        write(dir.path(), "002-flows", "CREATE TABLE flows (bot_id INTEGER REFERENCES bots(id));");
        let (_db, applicator) = db_applicator(dir.path());

        let first = applicator.apply_pending().unwrap();
        assert_eq!(first.applied_names, ["001-init", "002-flows"]);
        assert!(first.skipped_names.is_empty());
        assert!(applicator.is_applied("002-flows").unwrap());

        let second = applicator.apply_pending().unwrap();
        assert!(second.applied_names.is_empty());
        assert_eq!(second.skipped_names, ["001-init", "002-flows"]);
    }

    #[test]
    fn lock_lease_defaults_to_configured_default() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, applicator) = db_applicator(dir.path());
        assert_eq!(applicator.lock_lease, LockConfig::default().lease());
    }

    #[test]
    fn modified_applied_migration_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001-init", "CREATE TABLE bots (id INTEGER PRIMARY KEY);");
        let (_db, applicator) = db_applicator(dir.path());
        applicator.apply_pending().unwrap();

        write(dir.path(), "001-init", "CREATE TABLE bots (id INTEGER PRIMARY KEY, name TEXT);");
        write(dir.path(), "002-flows", "CREATE TABLE flows (id INTEGER);");

        let err = applicator.apply_pending().unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { ref name, .. } if name == "001-init"));
        assert!(!applicator.is_applied("002-flows").unwrap());
    }

    #[test]
    fn checksum_verification_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001-init", "CREATE TABLE bots (id INTEGER PRIMARY KEY);");
        let (db, applicator) = db_applicator(dir.path());
        applicator.apply_pending().unwrap();

        write(dir.path(), "001-init", "CREATE TABLE bots (id INTEGER PRIMARY KEY, name TEXT);");
        let ledger = Arc::new(DatabaseLedger::new(db.clone()));
        let applicator = MigrationApplicator::new(dir.path(), db, ledger).verify_checksums(false);
        let report = applicator.apply_pending().unwrap();
        assert_eq!(report.skipped_names, ["001-init"]);
    }

    #[test]
    fn held_lock_fails_fast_without_applying() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001-init", "CREATE TABLE bots (id INTEGER PRIMARY KEY);");
        let (db, applicator) = db_applicator(dir.path());
        assert!(
            db.try_acquire_lock("other-runner", Duration::from_secs(60))
                .unwrap()
        );

        let err = applicator.apply_pending().unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
        assert!(!applicator.is_applied("001-init").unwrap());

        db.release_lock("other-runner").unwrap();
        assert_eq!(applicator.apply_pending().unwrap().applied_names, ["001-init"]);
    }

    #[test]
    fn lock_is_released_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001-broken", "INSERT INTO nowhere VALUES (1);");
        let (db, applicator) = db_applicator(dir.path());

        assert!(matches!(
            applicator.apply_pending(),
            Err(Error::Application { .. })
        ));
        assert!(db.try_acquire_lock("next-runner", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn unsorted_definitions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, applicator) = db_applicator(dir.path());
        let definitions = vec![
            MigrationDefinition::new("002-b", "SELECT 1;"),
            MigrationDefinition::new("001-a", "SELECT 1;"),
        ];
        assert!(matches!(
            applicator.apply_definitions(&definitions),
            Err(Error::Discovery(_))
        ));
    }

    #[test]
    fn status_reports_pending_applied_drifted_and_orphaned() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001-init", "CREATE TABLE bots (id INTEGER PRIMARY KEY);");
        write(dir.path(), "002-flows", "CREATE TABLE flows (id INTEGER);");
        write(dir.path(), "003-old", "CREATE TABLE legacy (id INTEGER);");

        let db = Arc::new(SqliteDatabase::in_memory().unwrap());
        let ledger = Arc::new(FileLedger::open(&ledger_dir.path().join("ledger")).unwrap());
        let applicator = MigrationApplicator::new(dir.path(), db, ledger);
        applicator.apply_pending().unwrap();

        std::fs::remove_file(dir.path().join("003-old.sql")).unwrap();
        write(dir.path(), "002-flows", "CREATE TABLE flows (id INTEGER, name TEXT);");
        write(dir.path(), "004-new", "CREATE TABLE extra (id INTEGER);");

        let statuses = applicator.status().unwrap();
        let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["001-init", "002-flows", "003-old", "004-new"]);
        assert!(matches!(statuses[0].state, MigrationState::Applied { .. }));
        assert!(matches!(statuses[1].state, MigrationState::Drifted { .. }));
        assert!(matches!(statuses[2].state, MigrationState::Orphaned { .. }));
        assert_eq!(statuses[3].state, MigrationState::Pending);
    }
}
