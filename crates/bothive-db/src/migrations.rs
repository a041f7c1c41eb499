use std::path::{Path, PathBuf};

use bothive_common::{Error, Result};
use ring::digest::{SHA256, digest};
use tracing::debug;

/// Marker that, as the first non-blank line of a migration, makes it run
/// outside a transaction.
///
/// Every other migration is wrapped in a transaction by the applicator, so
/// its body must not contain `BEGIN`/`COMMIT` of its own. A body that manages
/// its own transaction needs this marker.
pub const NO_TRANSACTION_DIRECTIVE: &str = "-- bothive:no-transaction";

const MIGRATION_EXTENSION: &str = "sql";

/// A single schema migration loaded from the migration source.
///
/// Migrations are identified by the file stem of their `.sql` file and
/// applied in ascending byte-wise order of that name, so file names must
/// sort in dependency order (e.g. `001-init.sql`, `002-flows.sql`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDefinition {
    pub name: String,
    pub path: PathBuf,
    pub sql: String,
    /// Hex-encoded SHA-256 of `sql`.
    pub checksum: String,
    pub transactional: bool,
}

impl MigrationDefinition {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        Self {
            name: name.into(),
            path: PathBuf::new(),
            checksum: checksum(&sql),
            transactional: !has_no_transaction_directive(&sql),
            sql,
        }
    }
}

/// List the migrations under `source_dir`, sorted by name ascending.
///
/// An existing directory with no `.sql` files yields an empty list.
pub fn discover_migrations(source_dir: &Path) -> Result<Vec<MigrationDefinition>> {
    let entries = std::fs::read_dir(source_dir).map_err(|e| {
        Error::Discovery(format!(
            "cannot read migration directory {}: {e}",
            source_dir.display()
        ))
    })?;

    let mut migrations = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            Error::Discovery(format!(
                "cannot list migration directory {}: {e}",
                source_dir.display()
            ))
        })?;
        let path = entry.path();

        // Follows symlinks, so a linked directory is skipped like a real one.
        if !path.is_file() {
            debug!("ignoring non-file entry {}", path.display());
            continue;
        }

        let Some(name) = migration_name(&path) else {
            debug!("ignoring non-migration file {}", path.display());
            continue;
        };

        let sql = std::fs::read_to_string(&path)
            .map_err(|e| Error::Discovery(format!("cannot read {}: {e}", path.display())))?;

        let mut definition = MigrationDefinition::new(name, sql);
        definition.path = path;
        migrations.push(definition);
    }

    migrations.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(
        "discovered {} migration(s) in {}",
        migrations.len(),
        source_dir.display()
    );
    Ok(migrations)
}

fn migration_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    if file_name.starts_with('.') {
        return None;
    }
    if path.extension()?.to_str()? != MIGRATION_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_string())
}

fn has_no_transaction_directive(sql: &str) -> bool {
    sql.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .is_some_and(|line| line.eq_ignore_ascii_case(NO_TRANSACTION_DIRECTIVE))
}

/// Hex-encoded SHA-256 of a migration body.
pub fn checksum(sql: &str) -> String {
    digest(&SHA256, sql.as_bytes())
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
