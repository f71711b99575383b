//! Async key-value adapter over SQLite: one table per collection plus `settings`, `keyval`
//! and `legacy_store`.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use estate_state_core::CollectionName;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::executor::SqliteExecutor;
use crate::StorageError;

pub const SETTINGS_TABLE: &str = "settings";
pub const KEYVAL_TABLE: &str = "keyval";
pub const LEGACY_TABLE: &str = "legacy_store";

/// Version written to `PRAGMA user_version` by the newest schema upgrade.
pub const SCHEMA_VERSION: i64 = 1;

/// One keyed row of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub value: Value,
}

impl StoredRecord {
    #[must_use]
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self { key: key.into(), value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Clear the table, then write the records in order.
    Replace,
    /// Upsert the records, leaving other rows alone.
    Upsert,
}

/// Writes for one table inside a [`KeyValueBackend::replace_all`] transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TableBatch {
    pub table: String,
    pub mode: BatchMode,
    pub records: Vec<StoredRecord>,
}

impl TableBatch {
    #[must_use]
    pub fn replace(table: impl Into<String>, records: Vec<StoredRecord>) -> Self {
        Self { table: table.into(), mode: BatchMode::Replace, records }
    }

    #[must_use]
    pub fn upsert(table: impl Into<String>, records: Vec<StoredRecord>) -> Self {
        Self { table: table.into(), mode: BatchMode::Upsert, records }
    }
}

/// Every table the adapter creates and accepts, collections first.
#[must_use]
pub fn expected_tables() -> Vec<&'static str> {
    CollectionName::ALL
        .into_iter()
        .map(CollectionName::table_name)
        .chain([SETTINGS_TABLE, KEYVAL_TABLE, LEGACY_TABLE])
        .collect()
}

fn known_table(table: &str) -> Result<&'static str, StorageError> {
    expected_tables()
        .into_iter()
        .find(|known| *known == table)
        .ok_or_else(|| StorageError::UnknownTable(table.to_string()))
}

/// Durable storage contract used by the persistence manager and the migration guard.
///
/// Every operation is asynchronous and reports failures to the caller; nothing is retried.
pub trait KeyValueBackend: Send + Sync {
    /// Records of `table` in insertion order.
    fn get_all(
        &self,
        table: &str,
    ) -> impl Future<Output = Result<Vec<StoredRecord>, StorageError>> + Send;

    fn get(
        &self,
        table: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<StoredRecord>, StorageError>> + Send;

    /// Insert or replace by key; a replaced record keeps its position.
    fn put(
        &self,
        table: &str,
        record: StoredRecord,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Upsert every record in one transaction.
    fn bulk_put(
        &self,
        table: &str,
        records: Vec<StoredRecord>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Returns whether a record was removed.
    fn delete(&self, table: &str, key: &str)
        -> impl Future<Output = Result<bool, StorageError>> + Send;

    fn clear(&self, table: &str) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Apply every batch in one transaction.
    fn replace_all(
        &self,
        batches: Vec<TableBatch>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Row count per expected table. Tables that no longer exist are left out.
    fn table_counts(
        &self,
    ) -> impl Future<Output = Result<BTreeMap<String, u64>, StorageError>> + Send;
}

/// SQLite implementation of [`KeyValueBackend`].
#[derive(Debug, Clone)]
pub struct SqliteKvStore {
    executor: SqliteExecutor,
}

impl SqliteKvStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened, the schema is newer than this build,
    /// or an expected table is missing after the upgrade.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        upgrade_schema(&mut conn)?;
        tracing::debug!(path = %path.display(), "opened sqlite key-value store");
        Ok(Self { executor: SqliteExecutor::spawn(conn)? })
    }

    /// # Errors
    /// Returns an error when the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let mut conn = Connection::open_in_memory()?;
        upgrade_schema(&mut conn)?;
        Ok(Self { executor: SqliteExecutor::spawn(conn)? })
    }

    /// Schema version currently recorded in the database.
    ///
    /// # Errors
    /// Returns an error when the pragma cannot be read.
    pub async fn schema_version(&self) -> Result<i64, StorageError> {
        self.executor.run(|conn| read_user_version(conn)).await
    }

    /// Copy the whole database to `dest` with the SQLite online backup API.
    ///
    /// # Errors
    /// Returns an error when the destination cannot be written.
    pub async fn backup_to(&self, dest: PathBuf) -> Result<(), StorageError> {
        self.executor
            .run(move |conn| {
                conn.backup(DatabaseName::Main, &dest, None)?;
                Ok(())
            })
            .await
    }
}

fn read_user_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
           seq INTEGER PRIMARY KEY AUTOINCREMENT,
           key TEXT NOT NULL UNIQUE,
           value_json TEXT NOT NULL
         );"
    )
}

fn upgrade_schema(conn: &mut Connection) -> Result<(), StorageError> {
    let found = read_user_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(StorageError::SchemaMismatch { found, supported: SCHEMA_VERSION });
    }

    if found < 1 {
        let tx = conn.transaction()?;
        for table in expected_tables() {
            tx.execute_batch(&create_table_sql(table))?;
        }
        tx.pragma_update(None, "user_version", 1_i64)?;
        tx.commit()?;
        tracing::info!(from = found, to = SCHEMA_VERSION, "upgraded key-value schema");
    }

    for table in expected_tables() {
        if !table_exists(conn, table)? {
            return Err(StorageError::MissingTable(table.to_string()));
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StorageError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

fn decode_row(key: String, value_json: &str) -> Result<StoredRecord, StorageError> {
    Ok(StoredRecord { key, value: serde_json::from_str(value_json)? })
}

fn upsert_row(conn: &Connection, table: &str, record: &StoredRecord) -> Result<(), StorageError> {
    let value_json = serde_json::to_string(&record.value)?;
    conn.execute(
        &format!(
            "INSERT INTO {table} (key, value_json) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json"
        ),
        params![record.key, value_json],
    )?;
    Ok(())
}

impl KeyValueBackend for SqliteKvStore {
    async fn get_all(&self, table: &str) -> Result<Vec<StoredRecord>, StorageError> {
        let table = known_table(table)?;
        self.executor
            .run(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT key, value_json FROM {table} ORDER BY seq"))?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                let mut records = Vec::new();
                for row in rows {
                    let (key, value_json) = row?;
                    records.push(decode_row(key, &value_json)?);
                }
                Ok(records)
            })
            .await
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        let table = known_table(table)?;
        let key = key.to_string();
        self.executor
            .run(move |conn| {
                let value_json = conn
                    .query_row(
                        &format!("SELECT value_json FROM {table} WHERE key = ?1"),
                        params![key],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                value_json.map(|value_json| decode_row(key, &value_json)).transpose()
            })
            .await
    }

    async fn put(&self, table: &str, record: StoredRecord) -> Result<(), StorageError> {
        let table = known_table(table)?;
        self.executor.run(move |conn| upsert_row(conn, table, &record)).await
    }

    async fn bulk_put(&self, table: &str, records: Vec<StoredRecord>) -> Result<(), StorageError> {
        let table = known_table(table)?;
        self.executor
            .run(move |conn| {
                let tx = conn.transaction()?;
                for record in &records {
                    upsert_row(&tx, table, record)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, table: &str, key: &str) -> Result<bool, StorageError> {
        let table = known_table(table)?;
        let key = key.to_string();
        self.executor
            .run(move |conn| {
                let removed =
                    conn.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])?;
                Ok(removed > 0)
            })
            .await
    }

    async fn clear(&self, table: &str) -> Result<(), StorageError> {
        let table = known_table(table)?;
        self.executor
            .run(move |conn| {
                conn.execute(&format!("DELETE FROM {table}"), [])?;
                Ok(())
            })
            .await
    }

    async fn replace_all(&self, batches: Vec<TableBatch>) -> Result<(), StorageError> {
        let mut resolved = Vec::with_capacity(batches.len());
        for batch in batches {
            resolved.push((known_table(&batch.table)?, batch));
        }
        self.executor
            .run(move |conn| {
                let tx = conn.transaction()?;
                for (table, batch) in &resolved {
                    if batch.mode == BatchMode::Replace {
                        tx.execute(&format!("DELETE FROM {table}"), [])?;
                    }
                    for record in &batch.records {
                        upsert_row(&tx, table, record)?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn table_counts(&self) -> Result<BTreeMap<String, u64>, StorageError> {
        self.executor
            .run(|conn| {
                let mut counts = BTreeMap::new();
                for table in expected_tables() {
                    if !table_exists(conn, table)? {
                        continue;
                    }
                    let count: i64 =
                        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                            row.get(0)
                        })?;
                    counts.insert(table.to_string(), u64::try_from(count).unwrap_or_default());
                }
                Ok(counts)
            })
            .await
    }
}
