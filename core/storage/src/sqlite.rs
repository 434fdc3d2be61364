//! SQLite-backed local store.
//!
//! All tables share one `records` table keyed by `(tbl, id)`; the typed
//! business fields are stored as a JSON document. The same database holds a
//! `sync_metadata` key/value table for the sync cursor.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use fitsync_common::{EntityFields, Error, Record, RecordId, Result, Table};

use crate::kv::KeyValueStore;
use crate::store::{apply_mutation, mark_deleted, LocalStore, NewRecord, Predicate, StoreTxn};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        tbl TEXT NOT NULL,
        id TEXT NOT NULL,
        fields TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER,
        sync_status TEXT NOT NULL,
        PRIMARY KEY (tbl, id)
    );

    CREATE TABLE IF NOT EXISTS sync_metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_records_status ON records(tbl, sync_status);
"#;

const COLUMNS: &str = "id, fields, created_at, updated_at, deleted_at, sync_status";

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Local store persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a database file.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(db_err)?;
        let store = Self::from_connection(conn)?;
        info!("Local store opened at {}", db_path.as_ref().display());
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of rows in a table, including soft-deleted ones.
    pub async fn count(&self, table: Table) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE tbl = ?1",
                params![table.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as u64)
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTxn>> {
        let conn = self.conn.clone().lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db_err)?;
        Ok(Box::new(SqliteTxn {
            conn,
            finished: false,
        }))
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT value FROM sync_metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO sync_metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM sync_metadata WHERE key = ?1", params![key])
            .map_err(db_err)?;
        Ok(())
    }
}

/// Raw column values of one row.
struct RawRow {
    id: String,
    fields: String,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
    sync_status: String,
}

impl RawRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            fields: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            deleted_at: row.get(4)?,
            sync_status: row.get(5)?,
        })
    }

    fn into_record(self, table: Table) -> Result<Record> {
        Ok(Record {
            id: RecordId::from(self.id),
            fields: EntityFields::from_json(table, &self.fields)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            sync_status: self.sync_status.parse()?,
        })
    }
}

struct SqliteTxn {
    conn: OwnedMutexGuard<Connection>,
    finished: bool,
}

impl SqliteTxn {
    fn not_found(table: Table, id: &RecordId) -> Error {
        Error::NotFound(format!("Record {} not found in {}", id, table))
    }

    fn write(&self, record: &Record) -> Result<()> {
        let fields = record.fields.to_json()?;
        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO records
                (tbl, id, fields, created_at, updated_at, deleted_at, sync_status)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    record.table().as_str(),
                    record.id.as_str(),
                    fields,
                    record.created_at,
                    record.updated_at,
                    record.deleted_at,
                    record.sync_status.as_str(),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn select(&self, table: Table, status: Option<&str>, dirty: bool) -> Result<Vec<Record>> {
        let mut sql = format!("SELECT {} FROM records WHERE tbl = ?1", COLUMNS);
        if status.is_some() {
            sql.push_str(" AND sync_status = ?2");
        } else if dirty {
            sql.push_str(" AND sync_status != 'synced'");
        }
        sql.push_str(" ORDER BY created_at, id");

        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = match status {
            Some(status) => stmt.query_map(params![table.as_str(), status], RawRow::read),
            None => stmt.query_map(params![table.as_str()], RawRow::read),
        }
        .map_err(db_err)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(db_err)?.into_record(table)?);
        }
        Ok(records)
    }
}

impl StoreTxn for SqliteTxn {
    fn ensure_collection(&self, _table: Table) -> Result<()> {
        self.conn
            .query_row("SELECT 1 FROM records LIMIT 1", [], |_| Ok(()))
            .optional()
            .map_err(db_err)?;
        Ok(())
    }

    fn find(&self, table: Table, id: &RecordId) -> Result<Option<Record>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM records WHERE tbl = ?1 AND id = ?2", COLUMNS),
                params![table.as_str(), id.as_str()],
                RawRow::read,
            )
            .optional()
            .map_err(db_err)?;
        row.map(|r| r.into_record(table)).transpose()
    }

    fn query(&self, table: Table, predicate: &Predicate) -> Result<Vec<Record>> {
        // Status filters run in SQL; everything else is evaluated on the typed record.
        let records = match predicate {
            Predicate::Status(status) => self.select(table, Some(status.as_str()), false)?,
            Predicate::Dirty => self.select(table, None, true)?,
            _ => self.select(table, None, false)?,
        };
        Ok(records.into_iter().filter(|r| predicate.matches(r)).collect())
    }

    fn create(&mut self, table: Table, init: NewRecord) -> Result<Record> {
        if init.fields.table() != table {
            return Err(Error::InvalidInput(format!(
                "Cannot create {} fields in {}",
                init.fields.table(),
                table
            )));
        }
        let record = init.into_record();
        if self.find(table, &record.id)?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "Record {} already exists in {}",
                record.id, table
            )));
        }
        self.write(&record)?;
        debug!("Created {} record {}", table, record.id);
        Ok(record)
    }

    fn update(
        &mut self,
        table: Table,
        id: &RecordId,
        mutator: &mut dyn FnMut(&mut Record),
    ) -> Result<Record> {
        let mut record = self
            .find(table, id)?
            .ok_or_else(|| Self::not_found(table, id))?;
        apply_mutation(&mut record, mutator)?;
        self.write(&record)?;
        Ok(record)
    }

    fn rekey(&mut self, table: Table, from: &RecordId, to: &RecordId) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if self.find(table, to)?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "Record {} already exists in {}",
                to, table
            )));
        }
        let changed = self
            .conn
            .execute(
                "UPDATE records SET id = ?3 WHERE tbl = ?1 AND id = ?2",
                params![table.as_str(), from.as_str(), to.as_str()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Self::not_found(table, from));
        }
        debug!("Re-keyed {} record {} -> {}", table, from, to);
        Ok(())
    }

    fn soft_delete(&mut self, table: Table, id: &RecordId) -> Result<()> {
        let mut record = self
            .find(table, id)?
            .ok_or_else(|| Self::not_found(table, id))?;
        mark_deleted(&mut record);
        self.write(&record)
    }

    fn hard_delete(&mut self, table: Table, id: &RecordId) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
                params![table.as_str(), id.as_str()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Self::not_found(table, id));
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT").map_err(db_err)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTxn {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Rollback failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitsync_common::{Client, ClientMeasurement, SyncStatus};
    use tempfile::TempDir;

    fn client_fields(email: &str) -> EntityFields {
        EntityFields::Clients(Client {
            first_name: "Test".into(),
            email: Some(email.into()),
            active: true,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_create_commit_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fitsync.db");

        let id = {
            let store = SqliteStore::open(&path).unwrap();
            let mut txn = store.begin().await.unwrap();
            let record = txn
                .create(Table::Clients, NewRecord::local(client_fields("a@x.com")))
                .unwrap();
            txn.commit().unwrap();
            record.id
        };

        let store = SqliteStore::open(&path).unwrap();
        let txn = store.begin().await.unwrap();
        let record = txn.find(Table::Clients, &id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Created);
        assert_eq!(record.fields, client_fields("a@x.com"));
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = SqliteStore::in_memory().unwrap();
        {
            let mut txn = store.begin().await.unwrap();
            txn.create(Table::Clients, NewRecord::local(client_fields("a@x.com")))
                .unwrap();
        }
        assert_eq!(store.count(Table::Clients).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dirty_query_and_status_filter() {
        let store = SqliteStore::in_memory().unwrap();
        let mut txn = store.begin().await.unwrap();
        txn.create(Table::Clients, NewRecord::local(client_fields("a@x.com")))
            .unwrap();
        txn.create(
            Table::Clients,
            NewRecord::remote(RecordId::from("c1"), client_fields("b@x.com")),
        )
        .unwrap();
        txn.create(
            Table::ClientMeasurements,
            NewRecord::local(EntityFields::ClientMeasurements(ClientMeasurement::default())),
        )
        .unwrap();

        assert_eq!(txn.query(Table::Clients, &Predicate::All).unwrap().len(), 2);
        assert_eq!(txn.query(Table::Clients, &Predicate::Dirty).unwrap().len(), 1);
        let synced = txn
            .query(Table::Clients, &Predicate::Status(SyncStatus::Synced))
            .unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].id.as_str(), "c1");
    }

    #[tokio::test]
    async fn test_rekey_soft_and_hard_delete() {
        let store = SqliteStore::in_memory().unwrap();
        let mut txn = store.begin().await.unwrap();
        let record = txn
            .create(Table::Clients, NewRecord::local(client_fields("a@x.com")))
            .unwrap();
        let taken = txn
            .create(
                Table::Clients,
                NewRecord::remote(RecordId::from("taken"), client_fields("c@x.com")),
            )
            .unwrap();

        assert!(matches!(
            txn.rekey(Table::Clients, &record.id, &taken.id),
            Err(Error::AlreadyExists(_))
        ));
        let server_id = RecordId::from("srv42");
        txn.rekey(Table::Clients, &record.id, &server_id).unwrap();

        txn.soft_delete(Table::Clients, &server_id).unwrap();
        let deleted = txn.find(Table::Clients, &server_id).unwrap().unwrap();
        assert_eq!(deleted.sync_status, SyncStatus::Deleted);

        txn.hard_delete(Table::Clients, &server_id).unwrap();
        assert!(txn.find(Table::Clients, &server_id).unwrap().is_none());
        assert!(matches!(
            txn.hard_delete(Table::Clients, &server_id),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_key_values() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.get("last_pulled_at").await.unwrap(), None);
        store.set("last_pulled_at", "42").await.unwrap();
        assert_eq!(store.get("last_pulled_at").await.unwrap().as_deref(), Some("42"));
        store.remove("last_pulled_at").await.unwrap();
        assert_eq!(store.get("last_pulled_at").await.unwrap(), None);
    }
}
