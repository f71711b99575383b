//! `StateEngine`: the single entry point the UI layer and the CLI use to read and change
//! estate state.
//!
//! Every change goes through [`StateEngine::apply_mutation`], which validates the result,
//! records it in history and persists it before listeners are told about it.

use std::collections::BTreeMap;

use estate_state_core::{
    AuditQuery, AuditRecord, CollectionName, DocumentStore, History, Record, SettingsPatch,
    StateError, DEFAULT_HISTORY_CAPACITY,
};
use estate_state_store_sqlite::{
    run_startup_migration, HealthReport, KeyValueBackend, LegacySource, MigrationGuard,
    MigrationOutcome, PersistenceManager, RetryPolicy, StorageError,
    DEFAULT_LEGACY_KEY,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub history_capacity: usize,
    pub legacy_key: String,
    pub migration_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            legacy_key: DEFAULT_LEGACY_KEY.to_string(),
            migration_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    State(#[from] StateError),
    /// A history entry could not be restored; history is unchanged.
    #[error("cannot restore history entry: {0}")]
    Validation(StateError),
    #[error("legacy migration failed: {0}")]
    Migration(String),
}

impl EngineError {
    /// Single human-readable message shown to the user for this failure.
    #[must_use]
    pub fn notification(&self) -> String {
        match self {
            Self::Storage(StorageError::QuotaExceeded(_)) => {
                "Saving failed: storage is full. Free some space and try again.".to_string()
            }
            Self::Storage(StorageError::SchemaMismatch { .. }) => {
                "Saved data was written by a newer version of the application.".to_string()
            }
            Self::Storage(_) => {
                "Saving failed. Your latest change is kept in memory; try again.".to_string()
            }
            Self::State(StateError::Rejected(reason)) => reason.clone(),
            Self::State(err) => format!("The change was not applied: {err}"),
            Self::Validation(_) => "This step cannot be restored.".to_string(),
            Self::Migration(_) => {
                "Old data could not be imported. Starting with empty data; it will be retried."
                    .to_string()
            }
        }
    }
}

/// View the UI should re-render after a change, with its parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveView {
    pub name: String,
    #[serde(default)]
    pub param: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCause {
    Mutation,
    Undo,
    Redo,
    Import,
    Flush,
}

/// Delivered to listeners after every successful persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub cause: ChangeCause,
    pub view: Option<ActiveView>,
    pub can_undo: bool,
    pub can_redo: bool,
}

pub type Listener = Box<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub migration_state: String,
    pub migration_outcome: String,
    pub history_capacity: usize,
    pub history_len: usize,
    pub can_undo: bool,
    pub can_redo: bool,
    pub dirty: bool,
    pub table_counts: BTreeMap<String, u64>,
}

pub struct StateEngine<B> {
    config: EngineConfig,
    persistence: PersistenceManager<B>,
    live: DocumentStore,
    history: History,
    migration: MigrationOutcome,
    dirty: bool,
    active_view: Option<ActiveView>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl<B: KeyValueBackend> StateEngine<B> {
    /// Run the startup migration protocol, then load the live store.
    ///
    /// A failed or deferred migration is not an error: the engine starts from whatever the
    /// structured store holds (the default state on a fresh backend), so changes made while
    /// the migration keeps failing survive restarts. The migration is retried on a later start.
    ///
    /// # Errors
    /// Returns an error when the structured store exists but cannot be loaded.
    pub async fn start<L: LegacySource>(
        config: EngineConfig,
        backend: B,
        legacy: &L,
    ) -> Result<Self, EngineError> {
        let persistence = PersistenceManager::new(backend);
        let migration = run_startup_migration(
            &persistence,
            legacy,
            &config.legacy_key,
            &config.migration_retry,
        )
        .await;

        if !migration.structured_store_ready() {
            tracing::warn!(outcome = ?migration, "legacy migration incomplete; using structured store as is");
        }
        let live = persistence.load().await?;
        tracing::info!(records = live.total_records(), "state engine started");

        Ok(Self {
            history: History::new(config.history_capacity),
            config,
            persistence,
            live,
            migration,
            dirty: false,
            active_view: None,
            listeners: Vec::new(),
            next_subscription: 0,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &DocumentStore {
        &self.live
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        self.persistence.backend()
    }

    #[must_use]
    pub fn history(&self) -> &History {
        &self.history
    }

    #[must_use]
    pub fn migration_outcome(&self) -> &MigrationOutcome {
        &self.migration
    }

    /// The startup migration failed; the UI should show [`EngineError::notification`] once.
    #[must_use]
    pub fn migration_error(&self) -> Option<EngineError> {
        match &self.migration {
            MigrationOutcome::Failed { error, .. } => Some(EngineError::Migration(error.clone())),
            _ => None,
        }
    }

    /// Whether the latest change has not reached durable storage yet.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn get_collection(&self, name: CollectionName) -> Vec<Record> {
        self.live.get_collection(name)
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn set_active_view(&mut self, name: impl Into<String>, param: Value) {
        self.active_view = Some(ActiveView { name: name.into(), param });
    }

    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// Apply `mutation` to the live store as one unit.
    ///
    /// `mutation` runs against a copy of the live store, which replaces it only once the
    /// mutation succeeds and the copy validates. On failure (or a panic inside `mutation`)
    /// the live store and history are untouched. Otherwise the new state is recorded in history and persisted.
    ///
    /// # Errors
    /// Returns the mutation or validation error, or a storage error when persisting fails;
    /// in the latter case the change stays applied in memory and [`Self::flush`] retries.
    pub async fn apply_mutation<F, T>(&mut self, mutation: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut DocumentStore) -> Result<T, StateError>,
    {
        let mut draft = self.live.clone();
        let result = mutation(&mut draft).and_then(|value| draft.validate().map(|()| value));
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = %err, "mutation rolled back");
                return Err(err.into());
            }
        };
        self.live = draft;
        self.history.record(&self.live);
        self.persist_and_notify(ChangeCause::Mutation).await?;
        Ok(value)
    }

    /// [`Self::apply_mutation`] followed by one audit entry in the same unit.
    ///
    /// # Errors
    /// As [`Self::apply_mutation`]; an empty description fails the whole mutation.
    pub async fn apply_logged<F, T>(
        &mut self,
        description: impl Into<String>,
        details: Value,
        mutation: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce(&mut DocumentStore) -> Result<T, StateError>,
    {
        let description = description.into();
        self.apply_mutation(move |store| {
            let value = mutation(store)?;
            store.audit_mut().append(description, details)?;
            Ok(value)
        })
        .await
    }

    /// Restore the previous snapshot. Returns `false` when there is nothing to undo.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when the snapshot is malformed, or a storage
    /// error when persisting the restored state fails.
    pub async fn undo(&mut self) -> Result<bool, EngineError> {
        let Some(snapshot) = self.history.undo().map_err(EngineError::Validation)? else {
            return Ok(false);
        };
        self.live = snapshot;
        tracing::info!(index = ?self.history.index(), "undo");
        self.persist_and_notify(ChangeCause::Undo).await?;
        Ok(true)
    }

    /// Restore the next snapshot. Returns `false` when there is nothing to redo.
    ///
    /// # Errors
    /// As [`Self::undo`].
    pub async fn redo(&mut self) -> Result<bool, EngineError> {
        let Some(snapshot) = self.history.redo().map_err(EngineError::Validation)? else {
            return Ok(false);
        };
        self.live = snapshot;
        tracing::info!(index = ?self.history.index(), "redo");
        self.persist_and_notify(ChangeCause::Redo).await?;
        Ok(true)
    }

    /// Persist the live store again after an earlier storage failure.
    ///
    /// # Errors
    /// Returns the storage error when persisting fails again.
    pub async fn flush(&mut self) -> Result<(), EngineError> {
        if self.dirty {
            self.persist_and_notify(ChangeCause::Flush).await?;
        }
        Ok(())
    }

    #[must_use]
    pub fn audit_query(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        self.live.audit().query(query).into_iter().cloned().collect()
    }

    /// Remove every audit entry without logging the clear itself.
    ///
    /// # Errors
    /// Returns a storage error when persisting fails.
    pub async fn clear_audit(&mut self) -> Result<usize, EngineError> {
        self.apply_mutation(|store| Ok(store.audit_mut().clear())).await
    }

    /// # Errors
    /// Returns [`StateError::Rejected`] when the patch touches the password while the store
    /// is locked, or a storage error when persisting fails.
    pub async fn update_settings(&mut self, patch: SettingsPatch) -> Result<(), EngineError> {
        if patch.password.is_some() && self.live.locked() {
            return Err(StateError::Rejected(
                "unlock before changing the password".to_string(),
            )
            .into());
        }
        self.apply_mutation(|store| {
            store.update_settings(patch);
            Ok(())
        })
        .await
    }

    /// # Errors
    /// Returns a storage error when persisting fails.
    pub async fn lock(&mut self) -> Result<(), EngineError> {
        self.apply_mutation(|store| {
            store.set_locked(true);
            Ok(())
        })
        .await
    }

    /// Clear the lock flag when `password` matches the stored hash.
    ///
    /// # Errors
    /// Returns [`StateError::Rejected`] for a wrong password, or a storage error when
    /// persisting fails.
    pub async fn unlock(&mut self, password: Option<&str>) -> Result<(), EngineError> {
        let accepted = match (&self.live.settings().password_hash, password) {
            (None, _) => true,
            (Some(_), Some(candidate)) => self.live.settings().verify_password(candidate),
            (Some(_), None) => false,
        };
        if !accepted {
            return Err(StateError::Rejected("incorrect password".to_string()).into());
        }
        self.apply_mutation(|store| {
            store.set_locked(false);
            Ok(())
        })
        .await
    }

    /// Plain JSON object mirroring the live store.
    ///
    /// # Errors
    /// Returns an error when a record cannot be serialized.
    pub fn export_all(&self) -> Result<Value, EngineError> {
        Ok(self.live.to_value()?)
    }

    /// Replace the whole store with `object` merged over the default state.
    ///
    /// The import succeeds or fails as a whole; on success it is recorded in history, logged
    /// in the audit trail and persisted, replacing every table.
    ///
    /// # Errors
    /// Returns an error when `object` does not decode or persisting fails.
    pub async fn import_all(&mut self, object: &Map<String, Value>) -> Result<usize, EngineError> {
        let imported = DocumentStore::from_loaded(object)?;
        let records = imported.total_records();
        self.apply_mutation(move |store| {
            *store = imported;
            store.audit_mut().append("Imported backup", json!({ "records": records }))?;
            Ok(records)
        })
        .await
    }

    /// Current migration flag, durable table counts and history state.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be queried.
    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let state = MigrationGuard::new(self.persistence.backend()).read().await?;
        Ok(EngineStatus {
            migration_state: state.as_str().to_string(),
            migration_outcome: outcome_label(&self.migration).to_string(),
            history_capacity: self.history.capacity(),
            history_len: self.history.len(),
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
            dirty: self.dirty,
            table_counts: self.persistence.stats().await?,
        })
    }

    /// # Errors
    /// Returns an error when the backend cannot be queried.
    pub async fn health(&self) -> Result<HealthReport, EngineError> {
        Ok(self.persistence.health().await?)
    }

    async fn persist_and_notify(&mut self, cause: ChangeCause) -> Result<(), EngineError> {
        if let Err(err) = self.persistence.persist(&self.live).await {
            self.dirty = true;
            tracing::error!(error = %err, ?cause, "failed to persist state");
            return Err(err.into());
        }
        self.dirty = false;

        let change = StateChange {
            cause,
            view: self.active_view.clone(),
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
        };
        for (_, listener) in &self.listeners {
            listener(&change);
        }
        Ok(())
    }
}

fn outcome_label(outcome: &MigrationOutcome) -> &'static str {
    match outcome {
        MigrationOutcome::AlreadyComplete => "already_complete",
        MigrationOutcome::NothingToMigrate => "nothing_to_migrate",
        MigrationOutcome::Migrated { .. } => "migrated",
        MigrationOutcome::Deferred { .. } => "deferred",
        MigrationOutcome::Failed { .. } => "failed",
    }
}
