use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bothive_common::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::database::SqliteDatabase;

pub(crate) const LEDGER_TABLE: &str = "_bothive_migrations";

/// Durable record of which migrations have been applied.
///
/// A name moves from absent to applied exactly once; there is no update or
/// delete path.
pub trait RecordStore: Send + Sync {
    /// All records, ordered by name.
    fn load(&self) -> Result<Vec<MigrationRecord>>;

    fn get(&self, name: &str) -> Result<Option<MigrationRecord>>;

    fn is_applied(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.is_some())
    }

    fn record_applied(&self, record: &MigrationRecord) -> Result<()>;

    /// Whether records live inside the target database, so the applicator can
    /// write them in the same transaction as the migration itself.
    fn shares_target_transaction(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Applied,
}

impl RecordStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Applied => "applied",
        }
    }
}

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub name: String,
    pub status: RecordStatus,
    pub applied_at: DateTime<Utc>,
    /// Absent on records written before checksums were tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl MigrationRecord {
    pub fn applied(name: impl Into<String>, checksum: Option<String>) -> Self {
        Self {
            name: name.into(),
            status: RecordStatus::Applied,
            applied_at: Utc::now(),
            checksum,
        }
    }
}

/// Append-only JSON-lines ledger kept on a persisted volume, one record per
/// line.
///
/// Every read goes back to the file, so records appended by another runner
/// are visible as soon as the migration lock has been handed over.
pub struct FileLedger {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl FileLedger {
    /// Open the ledger at `path` and check that it parses. A missing file is
    /// an empty ledger.
    pub fn open(path: &Path) -> Result<Self> {
        let records = read_ledger_file(path)?;
        debug!(
            "file ledger {} holds {} record(s)",
            path.display(),
            records.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            write_guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_guard
            .lock()
            .map_err(|_| Error::RecordStore("file ledger lock poisoned".into()))
    }
}

fn read_ledger_file(path: &Path) -> Result<BTreeMap<String, MigrationRecord>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            return Err(Error::RecordStore(format!(
                "cannot read ledger {}: {e}",
                path.display()
            )));
        }
    };

    let mut records = BTreeMap::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| {
            Error::RecordStore(format!("cannot read ledger {}: {e}", path.display()))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: MigrationRecord = serde_json::from_str(&line).map_err(|e| {
            Error::RecordStore(format!(
                "corrupt ledger {} at line {}: {e}",
                path.display(),
                idx + 1
            ))
        })?;
        if records.contains_key(&record.name) {
            return Err(Error::RecordStore(format!(
                "ledger {} records {} more than once",
                path.display(),
                record.name
            )));
        }
        records.insert(record.name.clone(), record);
    }
    Ok(records)
}

impl RecordStore for FileLedger {
    fn load(&self) -> Result<Vec<MigrationRecord>> {
        Ok(read_ledger_file(&self.path)?.into_values().collect())
    }

    fn get(&self, name: &str) -> Result<Option<MigrationRecord>> {
        Ok(read_ledger_file(&self.path)?.remove(name))
    }

    fn record_applied(&self, record: &MigrationRecord) -> Result<()> {
        let _guard = self.write_guard()?;
        if read_ledger_file(&self.path)?.contains_key(&record.name) {
            return Err(Error::RecordStore(format!(
                "{} is already recorded as applied",
                record.name
            )));
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::RecordStore(format!(
                    "cannot create ledger directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let write_err = |e: std::io::Error| {
            Error::RecordStore(format!("cannot write ledger {}: {e}", self.path.display()))
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;
        file.write_all(line.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        info!("recorded {} in {}", record.name, self.path.display());
        Ok(())
    }
}

/// Ledger kept as a table inside the target database.
pub struct DatabaseLedger {
    db: Arc<SqliteDatabase>,
}

impl DatabaseLedger {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }
}

impl RecordStore for DatabaseLedger {
    fn load(&self) -> Result<Vec<MigrationRecord>> {
        let conn = self.db.connection()?;
        if !ledger_table_exists(&conn)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT name, status, applied_at, checksum FROM {LEDGER_TABLE} ORDER BY name ASC"
            ))
            .map_err(|e| Error::RecordStore(format!("failed to prepare ledger query: {e}")))?;

        let rows = stmt
            .query_map([], read_record_row)
            .map_err(|e| Error::RecordStore(format!("failed to query ledger: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(
                row.map_err(|e| Error::RecordStore(format!("failed to read ledger row: {e}")))?,
            );
        }
        Ok(records)
    }

    fn get(&self, name: &str) -> Result<Option<MigrationRecord>> {
        let conn = self.db.connection()?;
        if !ledger_table_exists(&conn)? {
            return Ok(None);
        }

        conn.query_row(
            &format!(
                "SELECT name, status, applied_at, checksum FROM {LEDGER_TABLE} WHERE name = ?1"
            ),
            params![name],
            read_record_row,
        )
        .optional()
        .map_err(|e| Error::RecordStore(format!("failed to read ledger: {e}")))
    }

    fn record_applied(&self, record: &MigrationRecord) -> Result<()> {
        let conn = self.db.connection()?;
        ensure_ledger_table(&conn)?;
        insert_record(&conn, record)
    }

    fn shares_target_transaction(&self) -> bool {
        true
    }
}

pub(crate) fn ensure_ledger_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
            name TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            checksum TEXT
        );"
    ))
    .map_err(|e| Error::RecordStore(format!("failed to create ledger table: {e}")))
}

pub(crate) fn insert_record(conn: &Connection, record: &MigrationRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {LEDGER_TABLE} (name, status, applied_at, checksum) VALUES (?1, ?2, ?3, ?4)"
        ),
        params![
            record.name,
            record.status.as_str(),
            record.applied_at.to_rfc3339(),
            record.checksum,
        ],
    )
    .map_err(|e| Error::RecordStore(format!("failed to record {}: {e}", record.name)))?;
    Ok(())
}

fn ledger_table_exists(conn: &Connection) -> Result<bool> {
    conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
        params![LEDGER_TABLE],
        |row| row.get(0),
    )
    .map_err(|e| Error::RecordStore(format!("failed to check ledger table: {e}")))
}

fn read_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MigrationRecord> {
    let status: String = row.get(1)?;
    if status != RecordStatus::Applied.as_str() {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown migration status '{status}'").into(),
        ));
    }
    let applied_at: String = row.get(2)?;
    let applied_at = DateTime::parse_from_rfc3339(&applied_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(MigrationRecord {
        name: row.get(0)?,
        status: RecordStatus::Applied,
        applied_at,
        checksum: row.get(3)?,
    })
}
