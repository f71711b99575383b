//! Durable storage for the estate document store: an async key-value adapter over SQLite,
//! the replace-all persistence manager, and the one-time legacy migration.

mod error;
pub mod executor;
pub mod kv;
pub mod migration;
pub mod persistence;

pub use error::{MigrationError, StorageError};
pub use kv::{
    expected_tables, BatchMode, KeyValueBackend, SqliteKvStore, StoredRecord, TableBatch,
    KEYVAL_TABLE, LEGACY_TABLE, SCHEMA_VERSION, SETTINGS_TABLE,
};
pub use migration::{
    run_startup_migration, LegacyBlobFile, LegacySource, MigrationGuard, MigrationOutcome,
    MigrationState, NoLegacySource, RetryPolicy, DEFAULT_LEGACY_KEY,
};
pub use persistence::{HealthReport, PersistenceManager};
