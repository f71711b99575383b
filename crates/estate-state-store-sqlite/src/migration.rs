//! One-time migration from the legacy single-blob format into the per-collection tables.
//!
//! The guard persists a small state machine (`notStarted -> migrating -> complete | failed`)
//! in the `keyval` table. A failed attempt is retried on a later startup once the backoff
//! for its attempt count has elapsed.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use estate_state_core::DocumentStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::kv::{KeyValueBackend, StoredRecord, KEYVAL_TABLE, LEGACY_TABLE};
use crate::persistence::PersistenceManager;
use crate::{MigrationError, SqliteKvStore, StorageError};

pub const DEFAULT_LEGACY_KEY: &str = "estate_pro_complete_v1";

const STATE_KEY: &str = "migrationState";
const COMPLETE_KEY: &str = "migrationComplete";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum MigrationState {
    NotStarted,
    Migrating,
    Complete,
    Failed {
        attempts: u32,
        #[serde(rename = "lastError")]
        last_error: String,
        #[serde(rename = "lastAttemptAt", with = "time::serde::rfc3339")]
        last_attempt_at: OffsetDateTime,
    },
}

impl MigrationState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "notStarted",
            Self::Migrating => "migrating",
            Self::Complete => "complete",
            Self::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

/// Exponential backoff between failed migration attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base: Duration::from_secs(5), cap: Duration::from_secs(60 * 60) }
    }
}

impl RetryPolicy {
    /// Wait required after `attempts` consecutive failures.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1_u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Earliest time the next attempt may run.
    #[must_use]
    pub fn retry_at(&self, attempts: u32, last_attempt_at: OffsetDateTime) -> OffsetDateTime {
        let delay = time::Duration::try_from(self.delay_for(attempts))
            .unwrap_or(time::Duration::MAX);
        last_attempt_at.checked_add(delay).unwrap_or(last_attempt_at)
    }
}

/// Reads and writes the persisted [`MigrationState`].
#[derive(Debug)]
pub struct MigrationGuard<'a, B> {
    backend: &'a B,
}

impl<'a, B: KeyValueBackend> MigrationGuard<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Current state; an absent record reads as `NotStarted`, and a bare
    /// `migrationComplete = true` left by older builds reads as `Complete`.
    ///
    /// # Errors
    /// Returns an error when the backend read fails or the stored state does not decode.
    pub async fn read(&self) -> Result<MigrationState, StorageError> {
        if let Some(record) = self.backend.get(KEYVAL_TABLE, STATE_KEY).await? {
            return Ok(serde_json::from_value(record.value)?);
        }
        let complete = self
            .backend
            .get(KEYVAL_TABLE, COMPLETE_KEY)
            .await?
            .and_then(|record| record.value.as_bool())
            .unwrap_or(false);
        Ok(if complete { MigrationState::Complete } else { MigrationState::NotStarted })
    }

    /// # Errors
    /// Returns an error when the backend write fails.
    pub async fn write(&self, state: &MigrationState) -> Result<(), StorageError> {
        self.backend
            .bulk_put(
                KEYVAL_TABLE,
                vec![
                    StoredRecord::new(STATE_KEY, serde_json::to_value(state)?),
                    StoredRecord::new(COMPLETE_KEY, Value::Bool(state.is_complete())),
                ],
            )
            .await
    }
}

/// Where the legacy blob is read from.
pub trait LegacySource: Send + Sync {
    /// Raw JSON text stored under `key`, if any.
    fn read_blob(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, StorageError>> + Send;
}

/// Placeholder source used when no legacy data exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLegacySource;

impl LegacySource for NoLegacySource {
    async fn read_blob(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }
}

/// Legacy blob kept in the `legacy_store` table of the same database.
impl LegacySource for SqliteKvStore {
    async fn read_blob(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.get(LEGACY_TABLE, key).await?.map(|record| match record.value {
            Value::String(text) => text,
            other => other.to_string(),
        }))
    }
}

/// Legacy blob exported to a JSON file.
///
/// The file holds either the blob itself or a key/value dump of browser storage, in which
/// case the entry under the legacy key is used.
#[derive(Debug, Clone)]
pub struct LegacyBlobFile {
    path: PathBuf,
}

impl LegacyBlobFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LegacySource for LegacyBlobFile {
    async fn read_blob(&self, key: &str) -> Result<Option<String>, StorageError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if let Ok(Value::Object(mut dump)) = serde_json::from_str::<Value>(&text) {
            match dump.remove(key) {
                Some(Value::String(inner)) => return Ok(Some(inner)),
                Some(Value::Object(inner)) => return Ok(Some(Value::Object(inner).to_string())),
                _ => {}
            }
        }
        Ok(Some(text))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The guard was already complete; nothing was read or written.
    AlreadyComplete,
    /// No usable legacy blob; the guard was marked complete.
    NothingToMigrate,
    Migrated { customers: usize, records: usize },
    /// A recent failure is still inside its backoff window.
    Deferred { retry_at: OffsetDateTime },
    /// The attempt failed and was recorded; nothing was written to the structured tables.
    Failed { attempts: u32, error: String },
}

impl MigrationOutcome {
    /// Whether the structured tables are the source of truth after this outcome.
    #[must_use]
    pub fn structured_store_ready(&self) -> bool {
        matches!(self, Self::AlreadyComplete | Self::NothingToMigrate | Self::Migrated { .. })
    }
}

/// Run the startup migration protocol. Failures are logged and recorded, never returned.
pub async fn run_startup_migration<B, L>(
    manager: &PersistenceManager<B>,
    legacy: &L,
    legacy_key: &str,
    retry: &RetryPolicy,
) -> MigrationOutcome
where
    B: KeyValueBackend,
    L: LegacySource,
{
    let guard = MigrationGuard::new(manager.backend());
    let previous = match guard.read().await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "failed to read migration state");
            return MigrationOutcome::Failed { attempts: 0, error: err.to_string() };
        }
    };

    match &previous {
        MigrationState::Complete => return MigrationOutcome::AlreadyComplete,
        MigrationState::Failed { attempts, last_attempt_at, .. } => {
            let retry_at = retry.retry_at(*attempts, *last_attempt_at);
            if retry_at > OffsetDateTime::now_utc() {
                tracing::warn!(attempts, %retry_at, "legacy migration deferred after recent failure");
                return MigrationOutcome::Deferred { retry_at };
            }
        }
        MigrationState::NotStarted | MigrationState::Migrating => {}
    }

    match migrate(manager, &guard, legacy, legacy_key).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let attempts = previous.attempts().saturating_add(1);
            tracing::error!(error = %err, attempts, "legacy migration failed");
            let failed = MigrationState::Failed {
                attempts,
                last_error: err.to_string(),
                last_attempt_at: OffsetDateTime::now_utc(),
            };
            if let Err(mark_err) = guard.write(&failed).await {
                tracing::error!(error = %mark_err, "failed to record migration failure");
            }
            MigrationOutcome::Failed { attempts, error: err.to_string() }
        }
    }
}

async fn migrate<B, L>(
    manager: &PersistenceManager<B>,
    guard: &MigrationGuard<'_, B>,
    legacy: &L,
    legacy_key: &str,
) -> Result<MigrationOutcome, MigrationError>
where
    B: KeyValueBackend,
    L: LegacySource,
{
    guard.write(&MigrationState::Migrating).await?;

    let Some(text) = legacy.read_blob(legacy_key).await? else {
        guard.write(&MigrationState::Complete).await?;
        tracing::info!("no legacy data found; migration marked complete");
        return Ok(MigrationOutcome::NothingToMigrate);
    };
    let blob = parse_blob(&text)?;

    let customers = blob.get("customers").and_then(Value::as_array).map_or(0, Vec::len);
    if customers == 0 {
        guard.write(&MigrationState::Complete).await?;
        tracing::info!("legacy data holds no customers; migration marked complete");
        return Ok(MigrationOutcome::NothingToMigrate);
    }

    let store = DocumentStore::from_loaded(&blob)?;
    manager.persist(&store).await?;
    guard.write(&MigrationState::Complete).await?;
    let records = store.total_records();
    tracing::info!(customers, records, "migrated legacy data into structured store");
    Ok(MigrationOutcome::Migrated { customers, records })
}

fn parse_blob(text: &str) -> Result<Map<String, Value>, MigrationError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(blob)) => Ok(blob),
        Ok(other) => Err(MigrationError::LegacyParse(format!(
            "expected a JSON object, found {}",
            json_kind(&other)
        ))),
        Err(err) => Err(MigrationError::LegacyParse(err.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
