//! Outbound change detection.

use std::sync::Arc;
use tracing::debug;

use fitsync_common::{Result, SyncStatus, Table};
use fitsync_storage::{LocalStore, Predicate};

use crate::changeset::{ChangeSet, TableChanges};
use crate::transform::RecordTransformer;

/// Gathers dirty local records into an outbound change set.
pub struct ChangeCollector {
    transformer: Arc<RecordTransformer>,
}

impl ChangeCollector {
    /// Create a collector using the given transformer.
    pub fn new(transformer: Arc<RecordTransformer>) -> Self {
        Self { transformer }
    }

    /// Collect every record whose sync status is not `synced`.
    ///
    /// All tables are read in one transaction so that no record is caught
    /// mid-mutation. Tables without dirty records are omitted.
    pub async fn collect(&self, store: &dyn LocalStore, tables: &[Table]) -> Result<ChangeSet> {
        let mut txn = store.begin().await?;
        let mut changes = ChangeSet::new();

        for &table in tables {
            let dirty = txn.collection(table)?.query(&Predicate::Dirty)?;
            let mut out = TableChanges::default();
            for record in dirty {
                match record.sync_status {
                    SyncStatus::Created => out.created.push(self.transformer.to_remote(&record)),
                    SyncStatus::Updated => out.updated.push(self.transformer.to_remote(&record)),
                    SyncStatus::Deleted => out.deleted.push(record.id.clone()),
                    SyncStatus::Synced => {}
                }
            }
            if !out.is_empty() {
                debug!(
                    "Collected {} created, {} updated, {} deleted from {}",
                    out.created.len(),
                    out.updated.len(),
                    out.deleted.len(),
                    table
                );
            }
            changes.insert(table, out);
        }

        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitsync_common::{Client, EntityFields, Record, RecordId};
    use fitsync_storage::{create_local, delete_local, MemoryStore, NewRecord};
    use serde_json::json;

    fn client(email: &str) -> EntityFields {
        EntityFields::Clients(Client {
            first_name: "Test".into(),
            email: Some(email.into()),
            ..Default::default()
        })
    }

    fn synced(id: &str, email: &str) -> Record {
        NewRecord::remote(RecordId::from(id), client(email)).into_record()
    }

    fn collector() -> ChangeCollector {
        ChangeCollector::new(Arc::new(RecordTransformer::default()))
    }

    #[tokio::test]
    async fn test_partitions_by_status() {
        let store = MemoryStore::new();
        let created = create_local(&store, client("a@x.com")).await.unwrap();

        let mut changed = synced("c2", "b@x.com");
        changed.sync_status = SyncStatus::Updated;
        store.insert(changed).await;
        store.insert(synced("c3", "c@x.com")).await;
        store.insert(synced("c4", "d@x.com")).await;
        delete_local(&store, Table::Clients, &RecordId::from("c4"))
            .await
            .unwrap();

        let changes = collector().collect(&store, &Table::ALL).await.unwrap();
        assert_eq!(changes.tables(), vec![Table::Clients]);
        let clients = changes.get(Table::Clients).unwrap();
        assert_eq!(clients.created.len(), 1);
        assert_eq!(clients.created[0].id(), Some(created.id));
        assert_eq!(clients.created[0].get("email"), Some(&json!("a@x.com")));
        assert_eq!(clients.updated.len(), 1);
        assert_eq!(clients.updated[0].id(), Some(RecordId::from("c2")));
        assert_eq!(clients.deleted, vec![RecordId::from("c4")]);
    }

    #[tokio::test]
    async fn test_clean_store_collects_nothing() {
        let store = MemoryStore::new();
        store.insert(synced("c1", "a@x.com")).await;
        let changes = collector().collect(&store, &Table::ALL).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_collection_fails() {
        let store = MemoryStore::new();
        store.set_unavailable(Table::Trainers, true);
        assert!(collector().collect(&store, &Table::ALL).await.is_err());
    }
}
