use std::collections::BTreeMap;

use estate_state_core::document::settings_value;
use estate_state_core::{CollectionName, DocumentStore};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::kv::{expected_tables, KeyValueBackend, StoredRecord, TableBatch};
use crate::kv::{KEYVAL_TABLE, SETTINGS_TABLE};
use crate::StorageError;

const SETTINGS_KEY: &str = "settings";
const LOCKED_KEY: &str = "locked";

/// Result of a backend health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub missing_tables: Vec<String>,
    pub table_counts: BTreeMap<String, u64>,
}

/// Moves the whole document store to and from a [`KeyValueBackend`].
#[derive(Debug, Clone)]
pub struct PersistenceManager<B> {
    backend: B,
}

impl<B: KeyValueBackend> PersistenceManager<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Rewrite every collection table from `store`, plus the settings record and the lock
    /// flag, in one backend transaction.
    ///
    /// # Errors
    /// Returns an error when a record cannot be serialized or the backend write fails; the
    /// durable state is then unchanged.
    pub async fn persist(&self, store: &DocumentStore) -> Result<(), StorageError> {
        let mut batches = Vec::with_capacity(CollectionName::ALL.len() + 2);
        for name in CollectionName::ALL {
            let records = store
                .get_collection(name)
                .into_iter()
                .map(|record| Ok(StoredRecord::new(record.id().as_str(), record.to_value()?)))
                .collect::<Result<Vec<_>, StorageError>>()?;
            batches.push(TableBatch::replace(name.table_name(), records));
        }
        batches.push(TableBatch::replace(
            SETTINGS_TABLE,
            vec![StoredRecord::new(SETTINGS_KEY, settings_value(store.settings())?)],
        ));
        batches.push(TableBatch::upsert(
            KEYVAL_TABLE,
            vec![StoredRecord::new(LOCKED_KEY, Value::Bool(store.locked()))],
        ));

        self.backend.replace_all(batches).await?;
        tracing::debug!(records = store.total_records(), "persisted document store");
        Ok(())
    }

    /// Read every table back into a store shaped like [`DocumentStore::initialize_default`].
    ///
    /// # Errors
    /// Returns an error when the backend read fails or a stored record does not decode.
    pub async fn load(&self) -> Result<DocumentStore, StorageError> {
        let mut loaded = Map::new();
        for name in CollectionName::ALL {
            let rows = self.backend.get_all(name.table_name()).await?;
            let values = rows.into_iter().map(|row| row.value).collect();
            loaded.insert(name.as_str().to_string(), Value::Array(values));
        }
        if let Some(settings) = self.backend.get(SETTINGS_TABLE, SETTINGS_KEY).await? {
            loaded.insert(SETTINGS_KEY.to_string(), settings.value);
        }
        if let Some(locked) = self.backend.get(KEYVAL_TABLE, LOCKED_KEY).await? {
            loaded.insert(LOCKED_KEY.to_string(), locked.value);
        }

        let store = DocumentStore::from_loaded(&loaded)?;
        tracing::debug!(records = store.total_records(), "loaded document store");
        Ok(store)
    }

    /// Record count per durable table.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be queried.
    pub async fn stats(&self) -> Result<BTreeMap<String, u64>, StorageError> {
        self.backend.table_counts().await
    }

    /// # Errors
    /// Returns an error when the backend cannot be queried at all.
    pub async fn health(&self) -> Result<HealthReport, StorageError> {
        let table_counts = self.backend.table_counts().await?;
        let missing_tables = expected_tables()
            .into_iter()
            .filter(|table| !table_counts.contains_key(*table))
            .map(str::to_string)
            .collect::<Vec<_>>();
        Ok(HealthReport { ok: missing_tables.is_empty(), missing_tables, table_counts })
    }
}

#[cfg(test)]
mod tests {
    use estate_state_core::{AuditRecord, Customer, SettingsPatch, Unit};
    use serde_json::json;

    use super::*;
    use crate::SqliteKvStore;

    fn manager() -> PersistenceManager<SqliteKvStore> {
        match SqliteKvStore::open_in_memory() {
            Ok(kv) => PersistenceManager::new(kv),
            Err(err) => panic!("in-memory store should open: {err}"),
        }
    }

    #[tokio::test]
    async fn load_of_empty_backend_is_the_default_store() -> Result<(), StorageError> {
        let manager = manager();
        assert_eq!(manager.load().await?, DocumentStore::initialize_default());

        manager.persist(&DocumentStore::initialize_default()).await?;
        assert_eq!(manager.load().await?, DocumentStore::initialize_default());
        Ok(())
    }

    #[tokio::test]
    async fn persist_then_load_round_trips_typed_records() -> Result<(), StorageError> {
        let manager = manager();
        let mut store = DocumentStore::initialize_default();
        let mut customer = Customer::new("Ahmed");
        customer.extra.insert("vip".to_string(), json!(true));
        store.insert(customer)?;
        store.insert(Unit::new("A-101"))?;
        store.audit_mut().append("Added customer Ahmed", json!({ "name": "Ahmed" }))?;
        store.update_settings(SettingsPatch {
            theme: Some("light".to_string()),
            ..SettingsPatch::default()
        });
        store.set_locked(true);

        manager.persist(&store).await?;
        let loaded = manager.load().await?;
        assert_eq!(loaded, store);
        assert_eq!(loaded.collection::<AuditRecord>().len(), 1);

        let counts = manager.stats().await?;
        assert_eq!(counts.get("customers"), Some(&1));
        assert_eq!(counts.get("audit_log"), Some(&1));
        assert_eq!(counts.get(SETTINGS_TABLE), Some(&1));
        Ok(())
    }

    #[tokio::test]
    async fn persist_replaces_removed_records() -> Result<(), StorageError> {
        let manager = manager();
        let mut store = DocumentStore::initialize_default();
        let id = store.insert(Customer::new("Ahmed"))?;
        manager.persist(&store).await?;

        store.remove::<Customer>(&id)?;
        manager.persist(&store).await?;
        assert!(manager.load().await?.collection::<Customer>().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn health_reports_every_table() -> Result<(), StorageError> {
        let report = manager().health().await?;
        assert!(report.ok);
        assert!(report.missing_tables.is_empty());
        assert_eq!(report.table_counts.len(), expected_tables().len());
        Ok(())
    }

    #[tokio::test]
    async fn health_lists_tables_dropped_after_open() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.sqlite3");
        let manager = PersistenceManager::new(SqliteKvStore::open(&path)?);

        let conn = rusqlite::Connection::open(&path)?;
        conn.execute_batch("DROP TABLE brokers;")?;
        drop(conn);

        let report = manager.health().await?;
        assert!(!report.ok);
        assert_eq!(report.missing_tables, vec!["brokers".to_string()]);
        assert!(!report.table_counts.contains_key("brokers"));
        assert_eq!(report.table_counts.len(), expected_tables().len() - 1);
        Ok(())
    }
}
