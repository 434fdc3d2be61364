//! In-memory local store for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use fitsync_common::{Error, Record, RecordId, Result, Table};

use crate::store::{apply_mutation, mark_deleted, LocalStore, NewRecord, Predicate, StoreTxn};

type Tables = HashMap<Table, BTreeMap<RecordId, Record>>;

/// Injected failures, for exercising error paths.
#[derive(Debug, Default)]
struct Faults {
    unavailable: HashSet<Table>,
    fail_next_commit: bool,
}

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Transactions work on a copy of the tables that replaces
/// the shared state on commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<AsyncMutex<Tables>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a table's collection unreachable (or reachable again).
    pub fn set_unavailable(&self, table: Table, unavailable: bool) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        if unavailable {
            faults.unavailable.insert(table);
        } else {
            faults.unavailable.remove(&table);
        }
    }

    /// Make the next commit fail, leaving the committed state untouched.
    pub fn fail_next_commit(&self) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_next_commit = true;
    }

    /// Insert a record as-is, bypassing transactions.
    pub async fn insert(&self, record: Record) {
        let mut tables = self.tables.lock().await;
        tables
            .entry(record.table())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Committed records of a table.
    pub async fn records(&self, table: Table) -> Vec<Record> {
        let tables = self.tables.lock().await;
        tables
            .get(&table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed record by id.
    pub async fn get(&self, table: Table, id: &RecordId) -> Option<Record> {
        let tables = self.tables.lock().await;
        tables.get(&table).and_then(|t| t.get(id)).cloned()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTxn>> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTxn {
            guard,
            working,
            faults: self.faults.clone(),
        }))
    }
}

struct MemoryTxn {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryTxn {
    fn check(&self, table: Table) -> Result<()> {
        let faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        if faults.unavailable.contains(&table) {
            return Err(Error::Storage(format!("Collection {} is unavailable", table)));
        }
        Ok(())
    }

    fn table_mut(&mut self, table: Table) -> Result<&mut BTreeMap<RecordId, Record>> {
        self.check(table)?;
        Ok(self.working.entry(table).or_default())
    }

    fn not_found(table: Table, id: &RecordId) -> Error {
        Error::NotFound(format!("Record {} not found in {}", id, table))
    }
}

impl StoreTxn for MemoryTxn {
    fn ensure_collection(&self, table: Table) -> Result<()> {
        self.check(table)
    }

    fn find(&self, table: Table, id: &RecordId) -> Result<Option<Record>> {
        self.check(table)?;
        Ok(self.working.get(&table).and_then(|t| t.get(id)).cloned())
    }

    fn query(&self, table: Table, predicate: &Predicate) -> Result<Vec<Record>> {
        self.check(table)?;
        Ok(self
            .working
            .get(&table)
            .map(|t| t.values().filter(|r| predicate.matches(r)).cloned().collect())
            .unwrap_or_default())
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
        let records = self.table_mut(table)?;
        if records.contains_key(&record.id) {
            return Err(Error::AlreadyExists(format!(
                "Record {} already exists in {}",
                record.id, table
            )));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn update(
        &mut self,
        table: Table,
        id: &RecordId,
        mutator: &mut dyn FnMut(&mut Record),
    ) -> Result<Record> {
        let records = self.table_mut(table)?;
        let current = records.get(id).ok_or_else(|| Self::not_found(table, id))?;
        let mut updated = current.clone();
        apply_mutation(&mut updated, mutator)?;
        records.insert(id.clone(), updated.clone());
        Ok(updated)
    }

    fn rekey(&mut self, table: Table, from: &RecordId, to: &RecordId) -> Result<()> {
        let records = self.table_mut(table)?;
        if from == to {
            return Ok(());
        }
        if records.contains_key(to) {
            return Err(Error::AlreadyExists(format!(
                "Record {} already exists in {}",
                to, table
            )));
        }
        let mut record = records.remove(from).ok_or_else(|| Self::not_found(table, from))?;
        record.id = to.clone();
        records.insert(to.clone(), record);
        Ok(())
    }

    fn soft_delete(&mut self, table: Table, id: &RecordId) -> Result<()> {
        let records = self.table_mut(table)?;
        let record = records.get_mut(id).ok_or_else(|| Self::not_found(table, id))?;
        mark_deleted(record);
        Ok(())
    }

    fn hard_delete(&mut self, table: Table, id: &RecordId) -> Result<()> {
        let records = self.table_mut(table)?;
        records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(table, id))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        {
            let mut faults = this.faults.lock().unwrap_or_else(|e| e.into_inner());
            if faults.fail_next_commit {
                faults.fail_next_commit = false;
                return Err(Error::Storage("Commit failed".to_string()));
            }
        }
        let MemoryTxn {
            mut guard, working, ..
        } = this;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitsync_common::{Client, EntityFields, SyncStatus};

    fn client_fields(email: &str) -> EntityFields {
        EntityFields::Clients(Client {
            first_name: "Test".into(),
            email: Some(email.into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        let record = txn
            .create(Table::Clients, NewRecord::local(client_fields("a@x.com")))
            .unwrap();
        assert_eq!(record.sync_status, SyncStatus::Created);
        txn.commit().unwrap();

        let found = store.get(Table::Clients, &record.id).await.unwrap();
        assert_eq!(found.field("email"), record.field("email"));
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut txn = store.begin().await.unwrap();
            txn.create(Table::Clients, NewRecord::local(client_fields("a@x.com")))
                .unwrap();
        }
        assert!(store.records(Table::Clients).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_previous_state() {
        let store = MemoryStore::new();
        store.fail_next_commit();
        let mut txn = store.begin().await.unwrap();
        txn.create(Table::Clients, NewRecord::local(client_fields("a@x.com")))
            .unwrap();
        assert!(txn.commit().is_err());
        assert!(store.records(Table::Clients).await.is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_foreign_fields() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        let result = txn.create(Table::Trainers, NewRecord::local(client_fields("a@x.com")));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_update_pins_identity() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        let record = txn
            .create(Table::Clients, NewRecord::local(client_fields("a@x.com")))
            .unwrap();
        let updated = txn
            .collection(Table::Clients)
            .unwrap()
            .update(&record.id, |r| {
                r.id = RecordId::from("hijacked");
                r.sync_status = SyncStatus::Synced;
            })
            .unwrap();
        assert_eq!(updated.id, record.id);
        assert_eq!(updated.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_rekey_and_hard_delete() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        let record = txn
            .create(Table::Clients, NewRecord::local(client_fields("a@x.com")))
            .unwrap();
        let server_id = RecordId::from("srv42");
        txn.rekey(Table::Clients, &record.id, &server_id).unwrap();
        assert!(txn.find(Table::Clients, &record.id).unwrap().is_none());
        assert!(txn.find(Table::Clients, &server_id).unwrap().is_some());

        txn.hard_delete(Table::Clients, &server_id).unwrap();
        assert!(matches!(
            txn.hard_delete(Table::Clients, &server_id),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_soft_delete_marks_record() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        let record = txn
            .create(Table::Clients, NewRecord::local(client_fields("a@x.com")))
            .unwrap();
        txn.soft_delete(Table::Clients, &record.id).unwrap();
        let deleted = txn.find(Table::Clients, &record.id).unwrap().unwrap();
        assert_eq!(deleted.sync_status, SyncStatus::Deleted);
        assert!(deleted.deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_unavailable_collection() {
        let store = MemoryStore::new();
        store.set_unavailable(Table::Clients, true);
        let mut txn = store.begin().await.unwrap();
        assert!(txn.collection(Table::Clients).is_err());
        assert!(txn.query(Table::Clients, &Predicate::All).is_err());
        assert!(txn.collection(Table::Trainers).is_ok());
    }
}
