pub mod applicator;
pub mod database;
pub mod ledger;
pub mod migrations;
pub mod readiness;

pub use applicator::{AppliedReport, MigrationApplicator, MigrationState, MigrationStatus};
pub use database::{SqliteDatabase, TargetDatabase};
pub use ledger::{DatabaseLedger, FileLedger, MigrationRecord, RecordStatus, RecordStore};
pub use migrations::{MigrationDefinition, discover_migrations};
pub use readiness::{RetryPolicy, wait_until_reachable};
