use estate_state_core::StateError;
use rusqlite::ErrorCode;

/// Failures of the durable key-value backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("expected table {0} is missing after schema upgrade")]
    MissingTable(String),
    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaMismatch { found: i64, supported: i64 },
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("storage executor has shut down")]
    ExecutorClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => Self::QuotaExceeded(err.to_string()),
            _ => Self::Sqlite(err),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failures of the one-time legacy migration.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("legacy data could not be merged: {0}")]
    State(#[from] StateError),
    #[error("legacy blob is not valid: {0}")]
    LegacyParse(String),
}
