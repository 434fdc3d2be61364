//! Local writes performed by the application layer.
//!
//! These keep the per-record sync status honest: every local mutation leaves
//! the record dirty until the sync engine confirms it remotely.

use fitsync_common::{now_millis, EntityFields, Error, Record, RecordId, Result, SyncStatus, Table};

use crate::store::{LocalStore, NewRecord};

/// Create a record locally under a fresh temporary id.
pub async fn create_local(store: &dyn LocalStore, fields: EntityFields) -> Result<Record> {
    let table = fields.table();
    let mut txn = store.begin().await?;
    let record = txn.collection(table)?.create(NewRecord::local(fields))?;
    txn.commit()?;
    Ok(record)
}

/// Replace the business fields of a local record.
///
/// A synced record becomes `updated`; a record still pending its first push
/// stays `created`.
///
/// # Errors
/// - Record not found
/// - Record is soft-deleted
pub async fn update_local(
    store: &dyn LocalStore,
    id: &RecordId,
    fields: EntityFields,
) -> Result<Record> {
    let table = fields.table();
    let mut txn = store.begin().await?;
    let record = {
        let mut collection = txn.collection(table)?;
        let current = collection
            .find(id)?
            .ok_or_else(|| Error::NotFound(format!("Record {} not found in {}", id, table)))?;
        if current.sync_status == SyncStatus::Deleted {
            return Err(Error::Conflict(format!("Record {} is deleted", id)));
        }
        collection.update(id, |record| {
            record.fields = fields;
            record.updated_at = now_millis().max(record.updated_at + 1);
            if record.sync_status == SyncStatus::Synced {
                record.sync_status = SyncStatus::Updated;
            }
        })?
    };
    txn.commit()?;
    Ok(record)
}

/// Delete a local record.
///
/// A record the remote store has seen is soft-deleted, pending remote
/// confirmation. A record still waiting for its first push is removed
/// outright, so its temporary id never reaches the remote store.
///
/// # Errors
/// - Record not found
pub async fn delete_local(store: &dyn LocalStore, table: Table, id: &RecordId) -> Result<()> {
    let mut txn = store.begin().await?;
    {
        let mut collection = txn.collection(table)?;
        let current = collection
            .find(id)?
            .ok_or_else(|| Error::NotFound(format!("Record {} not found in {}", id, table)))?;
        if current.sync_status == SyncStatus::Created {
            collection.hard_delete(id)?;
        } else {
            collection.soft_delete(id)?;
        }
    }
    txn.commit()
}
