//! Local store trait definition.

use async_trait::async_trait;
use serde_json::Value;

use fitsync_common::{now_millis, EntityFields, Record, RecordId, Result, SyncStatus, Table};

/// Filter applied by [`StoreTxn::query`].
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Every record in the table.
    All,
    /// Records whose sync status is anything but `synced`.
    Dirty,
    /// Records with exactly this sync status.
    Status(SyncStatus),
    /// Records whose business field equals the value exactly.
    FieldEquals(String, Value),
    /// Records matching every `(field, value)` pair; strings compare
    /// case-insensitively after trimming. An empty key never matches.
    NaturalKey(Vec<(String, Value)>),
    /// All inner predicates must match.
    And(Vec<Predicate>),
}

impl Predicate {
    /// Evaluate the predicate against a record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Dirty => record.is_dirty(),
            Predicate::Status(status) => record.sync_status == *status,
            Predicate::FieldEquals(field, value) => record.field(field).as_ref() == Some(value),
            Predicate::NaturalKey(pairs) => {
                if pairs.is_empty() {
                    return false;
                }
                let fields = record.fields.to_map();
                pairs.iter().all(|(field, wanted)| match fields.get(field) {
                    Some(actual) => natural_eq(actual, wanted),
                    None => false,
                })
            }
            Predicate::And(inner) => inner.iter().all(|p| p.matches(record)),
        }
    }
}

fn natural_eq(actual: &Value, wanted: &Value) -> bool {
    match (actual, wanted) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => {
            let (a, b) = (a.trim(), b.trim());
            !a.is_empty() && a.eq_ignore_ascii_case(b)
        }
        (a, b) => a == b,
    }
}

/// Initializer for [`StoreTxn::create`].
///
/// Timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewRecord {
    /// Primary key to use; the store generates one when absent.
    pub id: Option<RecordId>,
    /// Business fields.
    pub fields: EntityFields,
    /// Initial sync status.
    pub sync_status: SyncStatus,
}

impl NewRecord {
    /// A record created by a local write, pending its first push.
    pub fn local(fields: EntityFields) -> Self {
        Self {
            id: None,
            fields,
            sync_status: SyncStatus::Created,
        }
    }

    /// A record that originated remotely and carries no local mutation.
    pub fn remote(id: RecordId, fields: EntityFields) -> Self {
        Self {
            id: Some(id),
            fields,
            sync_status: SyncStatus::Synced,
        }
    }

    /// Materialize the record with store-managed timestamps.
    pub fn into_record(self) -> Record {
        let now = now_millis();
        Record {
            id: self.id.unwrap_or_else(RecordId::generate),
            fields: self.fields,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            sync_status: self.sync_status,
        }
    }
}

/// Local store handing out write transactions.
///
/// A store admits a single open transaction at a time; `begin` waits for the
/// previous one to commit or roll back.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTxn>>;
}

/// A transaction over the local store.
///
/// Nothing becomes visible to other transactions before [`StoreTxn::commit`];
/// dropping the transaction rolls it back.
pub trait StoreTxn: Send {
    /// Check that a table's collection is reachable.
    ///
    /// # Errors
    /// - Collection cannot be opened
    fn ensure_collection(&self, table: Table) -> Result<()>;

    /// Find a record by id.
    fn find(&self, table: Table, id: &RecordId) -> Result<Option<Record>>;

    /// All records of a table matching the predicate.
    fn query(&self, table: Table, predicate: &Predicate) -> Result<Vec<Record>>;

    /// Insert a new record.
    ///
    /// # Errors
    /// - Fields belong to another table
    /// - A record with the requested id already exists
    fn create(&mut self, table: Table, init: NewRecord) -> Result<Record>;

    /// Apply `mutator` to an existing record and persist it.
    ///
    /// The mutator cannot change the record's id or table.
    ///
    /// # Errors
    /// - Record not found
    fn update(
        &mut self,
        table: Table,
        id: &RecordId,
        mutator: &mut dyn FnMut(&mut Record),
    ) -> Result<Record>;

    /// Move a record to a new primary key.
    ///
    /// # Errors
    /// - Source not found
    /// - Target id already taken
    fn rekey(&mut self, table: Table, from: &RecordId, to: &RecordId) -> Result<()>;

    /// Mark a record deleted locally, pending remote confirmation.
    ///
    /// # Errors
    /// - Record not found
    fn soft_delete(&mut self, table: Table, id: &RecordId) -> Result<()>;

    /// Physically remove a record.
    ///
    /// # Errors
    /// - Record not found
    fn hard_delete(&mut self, table: Table, id: &RecordId) -> Result<()>;

    /// Make every change of this transaction durable.
    fn commit(self: Box<Self>) -> Result<()>;
}

impl dyn StoreTxn {
    /// Table-bound view over this transaction.
    ///
    /// # Errors
    /// - Collection cannot be opened
    pub fn collection(&mut self, table: Table) -> Result<Collection<'_>> {
        self.ensure_collection(table)?;
        Ok(Collection { txn: self, table })
    }
}

/// A single table seen through an open transaction.
pub struct Collection<'a> {
    txn: &'a mut dyn StoreTxn,
    table: Table,
}

impl Collection<'_> {
    /// Table of this collection.
    pub fn table(&self) -> Table {
        self.table
    }

    /// Find a record by id.
    pub fn find(&self, id: &RecordId) -> Result<Option<Record>> {
        self.txn.find(self.table, id)
    }

    /// Records matching the predicate.
    pub fn query(&self, predicate: &Predicate) -> Result<Vec<Record>> {
        self.txn.query(self.table, predicate)
    }

    /// Insert a new record.
    pub fn create(&mut self, init: NewRecord) -> Result<Record> {
        self.txn.create(self.table, init)
    }

    /// Apply a one-shot mutation to a record.
    pub fn update<F>(&mut self, id: &RecordId, mutator: F) -> Result<Record>
    where
        F: FnOnce(&mut Record),
    {
        let mut mutator = Some(mutator);
        self.txn.update(self.table, id, &mut |record| {
            if let Some(f) = mutator.take() {
                f(record);
            }
        })
    }

    /// Move a record to a new primary key.
    pub fn rekey(&mut self, from: &RecordId, to: &RecordId) -> Result<()> {
        self.txn.rekey(self.table, from, to)
    }

    /// Soft-delete a record.
    pub fn soft_delete(&mut self, id: &RecordId) -> Result<()> {
        self.txn.soft_delete(self.table, id)
    }

    /// Physically remove a record.
    pub fn hard_delete(&mut self, id: &RecordId) -> Result<()> {
        self.txn.hard_delete(self.table, id)
    }
}

/// Run a mutator while pinning the record's identity.
pub(crate) fn apply_mutation(
    record: &mut Record,
    mutator: &mut dyn FnMut(&mut Record),
) -> Result<()> {
    let id = record.id.clone();
    let table = record.table();
    mutator(record);
    record.id = id;
    if record.table() != table {
        return Err(fitsync_common::Error::InvalidInput(format!(
            "Cannot move record {} from {} to {}",
            record.id,
            table,
            record.table()
        )));
    }
    Ok(())
}

/// Mark a record as soft-deleted.
pub(crate) fn mark_deleted(record: &mut Record) {
    let now = now_millis().max(record.updated_at + 1);
    record.deleted_at = Some(now);
    record.updated_at = now;
    record.sync_status = SyncStatus::Deleted;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitsync_common::Client;
    use serde_json::json;

    fn client(email: Option<&str>) -> Record {
        NewRecord::local(EntityFields::Clients(Client {
            first_name: "Ada".into(),
            email: email.map(String::from),
            ..Default::default()
        }))
        .into_record()
    }

    #[test]
    fn test_natural_key_is_case_insensitive() {
        let record = client(Some("Ada@Example.com "));
        let predicate = Predicate::NaturalKey(vec![("email".into(), json!("ada@example.com"))]);
        assert!(predicate.matches(&record));
    }

    #[test]
    fn test_natural_key_never_matches_null_or_empty() {
        let record = client(None);
        let predicate = Predicate::NaturalKey(vec![("email".into(), json!(null))]);
        assert!(!predicate.matches(&record));
        assert!(!Predicate::NaturalKey(vec![]).matches(&record));
    }

    #[test]
    fn test_status_predicates() {
        let record = client(Some("a@x.com"));
        assert!(Predicate::Dirty.matches(&record));
        assert!(Predicate::Status(SyncStatus::Created).matches(&record));
        assert!(!Predicate::Status(SyncStatus::Synced).matches(&record));
        assert!(Predicate::And(vec![
            Predicate::Dirty,
            Predicate::FieldEquals("first_name".into(), json!("Ada")),
        ])
        .matches(&record));
    }
}
