use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bothive_common::{Error, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, TransactionBehavior, params};
use tracing::{debug, info, warn};

use crate::ledger::{MigrationRecord, ensure_ledger_table, insert_record};
use crate::migrations::{MigrationDefinition, NO_TRANSACTION_DIRECTIVE};

const LOCK_TABLE: &str = "_bothive_migration_lock";

/// The database migrations are applied to.
pub trait TargetDatabase: Send + Sync {
    /// Cheap round trip proving the database is reachable and readable.
    fn ping(&self) -> Result<()>;

    /// Run a migration body. Transactional migrations run in a single
    /// transaction that is rolled back on failure. When `ledger_row` is given
    /// it is written in that same transaction.
    fn execute_migration(
        &self,
        definition: &MigrationDefinition,
        ledger_row: Option<&MigrationRecord>,
    ) -> Result<()>;

    /// Take the migration lock for `holder`. Returns `false` while another
    /// holder's lease is still live.
    fn try_acquire_lock(&self, holder: &str, lease: Duration) -> Result<bool>;

    /// Push the lease of a held lock `lease` into the future. Returns `false`
    /// when `holder` no longer owns the lock.
    fn renew_lock(&self, holder: &str, lease: Duration) -> Result<bool>;

    fn release_lock(&self, holder: &str) -> Result<()>;
}

/// SQLite target database.
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteDatabase {
    /// Open the database file at `db_path`. The parent directory must already
    /// exist; a missing volume is reported as an error rather than created.
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        debug!("opening target database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(db_path.to_path_buf()),
        })
    }

    /// Open an existing database file without write access and without
    /// touching its journal mode. A missing file is an error.
    pub fn open_read_only(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        debug!("opening target database read-only at {}", db_path.display());
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::Database(format!("failed to open database read-only: {e}")))?;

        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(db_path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("target database lock poisoned".into()))
    }
}

impl TargetDatabase for SqliteDatabase {
    fn ping(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
            .map_err(|e| Error::Database(format!("ping failed: {e}")))?;
        Ok(())
    }

    fn execute_migration(
        &self,
        definition: &MigrationDefinition,
        ledger_row: Option<&MigrationRecord>,
    ) -> Result<()> {
        let failed = |e: rusqlite::Error| {
            let mut cause = e.to_string();
            if definition.transactional && cause.contains("within a transaction") {
                cause.push_str(&format!(
                    "; a body that issues its own BEGIN/COMMIT must start with `{NO_TRANSACTION_DIRECTIVE}`"
                ));
            }
            Error::Application {
                name: definition.name.clone(),
                cause,
            }
        };
        let mut conn = self.connection()?;

        if !definition.transactional {
            warn!(
                "{} runs outside a transaction; a failure may leave it partially applied",
                definition.name
            );
            conn.execute_batch(&definition.sql).map_err(failed)?;
            if let Some(record) = ledger_row {
                ensure_ledger_table(&conn)?;
                insert_record(&conn, record)?;
            }
            return Ok(());
        }

        // Dropping the transaction without commit rolls it back.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(failed)?;
        tx.execute_batch(&definition.sql).map_err(failed)?;
        if let Some(record) = ledger_row {
            ensure_ledger_table(&tx)?;
            insert_record(&tx, record)?;
        }
        tx.commit().map_err(failed)?;
        Ok(())
    }

    fn try_acquire_lock(&self, holder: &str, lease: Duration) -> Result<bool> {
        let lock_err = |e: rusqlite::Error| Error::Lock(format!("failed to take lock: {e}"));
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(lock_err)?;

        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );"
        ))
        .map_err(lock_err)?;

        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::Lock(format!("invalid lock lease: {e}")))?;
        let expired = tx
            .execute(
                &format!("DELETE FROM {LOCK_TABLE} WHERE expires_at <= ?1"),
                params![timestamp(now)],
            )
            .map_err(lock_err)?;
        if expired > 0 {
            warn!("took over an expired migration lock");
        }

        tx.execute(
            &format!(
                "INSERT OR IGNORE INTO {LOCK_TABLE} (id, holder, acquired_at, expires_at)
                 VALUES (1, ?1, ?2, ?3)"
            ),
            params![holder, timestamp(now), timestamp(now + lease)],
        )
        .map_err(lock_err)?;

        let current: String = tx
            .query_row(
                &format!("SELECT holder FROM {LOCK_TABLE} WHERE id = 1"),
                [],
                |row| row.get(0),
            )
            .map_err(lock_err)?;
        tx.commit().map_err(lock_err)?;

        if current == holder {
            info!("migration lock acquired by {holder}");
            Ok(true)
        } else {
            debug!("migration lock held by {current}");
            Ok(false)
        }
    }

    fn renew_lock(&self, holder: &str, lease: Duration) -> Result<bool> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::Lock(format!("invalid lock lease: {e}")))?;
        let conn = self.connection()?;
        let renewed = conn
            .execute(
                &format!("UPDATE {LOCK_TABLE} SET expires_at = ?1 WHERE id = 1 AND holder = ?2"),
                params![timestamp(Utc::now() + lease), holder],
            )
            .map_err(|e| Error::Lock(format!("failed to renew lock: {e}")))?;
        Ok(renewed > 0)
    }

    fn release_lock(&self, holder: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            &format!("DELETE FROM {LOCK_TABLE} WHERE id = 1 AND holder = ?1"),
            params![holder],
        )
        .map_err(|e| Error::Lock(format!("failed to release lock: {e}")))?;
        debug!("migration lock released by {holder}");
        Ok(())
    }
}

// Fixed-width UTC so lexical comparison in SQL matches time order.
fn timestamp(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
