//! Applying change sets to the local store.
//!
//! Inbound, remote changes are written into the local store, reconciling
//! server echoes of locally created records by natural key instead of
//! duplicating them. Outbound, records confirmed by a push are marked synced.
//! Each pass runs in one local transaction.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use fitsync_common::coerce::value_as_i64;
use fitsync_common::{
    now_millis, EntityFields, Error, Record, RecordId, Result, SyncStatus, Table,
};
use fitsync_storage::{Collection, LocalStore, NewRecord, Predicate};

use crate::changeset::{ChangeSet, RemoteRecord, TableChanges};
use crate::config::TableConfig;
use crate::transform::RecordTransformer;

/// Outcome of applying one table's inbound changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableApplyResult {
    pub table: Table,
    /// Records inserted under their server id.
    pub created: usize,
    /// Records overwritten by id.
    pub updated: usize,
    /// Records physically removed.
    pub deleted: usize,
    /// Inbound creates merged into an existing local record by natural key.
    pub reconciled: usize,
    /// Updates and deletes whose target does not exist locally.
    pub skipped: usize,
    /// Per-record (or table-level) failures.
    pub errors: Vec<String>,
}

impl TableApplyResult {
    fn new(table: Table) -> Self {
        Self {
            table,
            created: 0,
            updated: 0,
            deleted: 0,
            reconciled: 0,
            skipped: 0,
            errors: Vec::new(),
        }
    }

    /// Whether every record applied without error.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of an inbound pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InboundReport {
    /// One entry per table of the change set.
    pub tables: Vec<TableApplyResult>,
    /// Whether the transaction was committed.
    pub committed: bool,
}

impl InboundReport {
    /// Every error over all tables.
    pub fn errors(&self) -> Vec<String> {
        self.tables
            .iter()
            .flat_map(|t| t.errors.iter().cloned())
            .collect()
    }

    /// Whether the pass applied cleanly and was committed.
    pub fn is_clean(&self) -> bool {
        self.committed && self.tables.iter().all(TableApplyResult::is_clean)
    }
}

/// Outcome of marking one table's pushed records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkResult {
    pub table: Table,
    /// Records cleared to `synced`.
    pub marked: usize,
    /// Records moved to their server-assigned id.
    pub rekeyed: usize,
    /// Records changed locally while the push was in flight; left dirty.
    pub still_dirty: usize,
    /// Soft-deleted records removed after the remote store took the delete.
    pub purged: usize,
    /// Pushed records that could not be located any more.
    pub not_found: usize,
    /// Per-record (or table-level) failures.
    pub errors: Vec<String>,
}

impl MarkResult {
    fn new(table: Table) -> Self {
        Self {
            table,
            marked: 0,
            rekeyed: 0,
            still_dirty: 0,
            purged: 0,
            not_found: 0,
            errors: Vec::new(),
        }
    }
}

/// Outcome of an outbound marking pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutboundReport {
    pub tables: Vec<MarkResult>,
}

impl OutboundReport {
    /// Total number of records cleared to `synced`.
    pub fn marked(&self) -> usize {
        self.tables.iter().map(|t| t.marked).sum()
    }

    /// Every error over all tables.
    pub fn errors(&self) -> Vec<String> {
        self.tables
            .iter()
            .flat_map(|t| t.errors.iter().cloned())
            .collect()
    }
}

/// Take the remote version of the business fields.
///
/// `fields` is already merged over the local ones. A pending local deletion
/// is kept: the remote store will be told on the next push.
fn overwrite(record: &mut Record, fields: EntityFields) {
    record.fields = fields;
    record.updated_at = now_millis().max(record.updated_at);
    if record.sync_status != SyncStatus::Deleted {
        record.sync_status = SyncStatus::Synced;
    }
}

fn describe(record: &RemoteRecord) -> String {
    record
        .id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "<no id>".to_string())
}

/// Writes change sets into the local store.
pub struct ChangeApplier {
    transformer: Arc<RecordTransformer>,
    natural_keys: HashMap<Table, Vec<String>>,
}

impl ChangeApplier {
    /// Create an applier with the natural keys of the configured tables.
    pub fn new(transformer: Arc<RecordTransformer>, tables: &[TableConfig]) -> Self {
        Self {
            transformer,
            natural_keys: tables
                .iter()
                .map(|t| (t.table, t.natural_keys.clone()))
                .collect(),
        }
    }

    /// Apply an inbound change set.
    ///
    /// Record failures are collected per table without stopping the pass. The
    /// transaction is committed only if no table reported an error; otherwise
    /// nothing is written and `committed` is false.
    ///
    /// A record that fails on every pull therefore holds back the cursor and
    /// the push phase until it is fixed remotely or locally. The failing ids
    /// are logged at error level on each rollback.
    ///
    /// # Errors
    /// - The transaction cannot be opened or committed
    pub async fn apply_inbound(
        &self,
        store: &dyn LocalStore,
        changes: &ChangeSet,
    ) -> Result<InboundReport> {
        let mut txn = store.begin().await?;
        let mut tables = Vec::new();

        for (table, table_changes) in changes.iter() {
            let mut result = TableApplyResult::new(table);
            match txn.collection(table) {
                Ok(mut collection) => self.apply_table(&mut collection, table_changes, &mut result),
                Err(e) => {
                    error!("Cannot open {}: {}", table, e);
                    result.errors.push(format!("{}: {}", table, e));
                }
            }
            debug!(
                "Applied {}: {} created, {} updated, {} deleted, {} reconciled, {} skipped, {} errors",
                table,
                result.created,
                result.updated,
                result.deleted,
                result.reconciled,
                result.skipped,
                result.errors.len()
            );
            tables.push(result);
        }

        let committed = tables.iter().all(TableApplyResult::is_clean);
        if committed {
            txn.commit()?;
        } else {
            let failed: Vec<&str> = tables
                .iter()
                .flat_map(|t| t.errors.iter().map(String::as_str))
                .collect();
            error!(
                "Inbound changes rolled back, cursor held: {}",
                failed.join("; ")
            );
        }
        Ok(InboundReport { tables, committed })
    }

    fn apply_table(
        &self,
        collection: &mut Collection<'_>,
        changes: &TableChanges,
        result: &mut TableApplyResult,
    ) {
        let table = collection.table();
        for record in &changes.created {
            if let Err(e) = self.apply_create(collection, record, result) {
                warn!("Failed to apply created {} {}: {}", table, describe(record), e);
                result
                    .errors
                    .push(format!("{} {}: {}", table, describe(record), e));
            }
        }
        for record in &changes.updated {
            if let Err(e) = self.apply_update(collection, record, result) {
                warn!("Failed to apply updated {} {}: {}", table, describe(record), e);
                result
                    .errors
                    .push(format!("{} {}: {}", table, describe(record), e));
            }
        }
        for id in &changes.deleted {
            if let Err(e) = Self::apply_delete(collection, id, result) {
                warn!("Failed to apply deleted {} {}: {}", table, id, e);
                result.errors.push(format!("{} {}: {}", table, id, e));
            }
        }
    }

    fn apply_create(
        &self,
        collection: &mut Collection<'_>,
        remote: &RemoteRecord,
        result: &mut TableApplyResult,
    ) -> Result<()> {
        let table = collection.table();
        let id = remote
            .id()
            .ok_or_else(|| Error::InvalidInput("Record without id".to_string()))?;
        if let Some(existing) = collection.find(&id)? {
            let merged = self.transformer.merge_local(table, &existing.fields, remote);
            collection.update(&id, |record| overwrite(record, merged))?;
            result.updated += 1;
            return Ok(());
        }

        let fields = self.transformer.to_local(table, remote);
        if let Some(local) = self.natural_match(collection, &fields, None)? {
            info!(
                "Reconciling {} {} with server record {} by natural key",
                table, local.id, id
            );
            let merged = self.transformer.merge_local(table, &local.fields, remote);
            collection.update(&local.id, |record| overwrite(record, merged))?;
            Self::adopt_server_id(collection, &local.id, &id)?;
            result.reconciled += 1;
            return Ok(());
        }

        collection.create(NewRecord::remote(id, fields))?;
        result.created += 1;
        Ok(())
    }

    fn apply_update(
        &self,
        collection: &mut Collection<'_>,
        remote: &RemoteRecord,
        result: &mut TableApplyResult,
    ) -> Result<()> {
        let table = collection.table();
        let id = remote
            .id()
            .ok_or_else(|| Error::InvalidInput("Record without id".to_string()))?;
        let Some(existing) = collection.find(&id)? else {
            warn!("Skipping update of missing {} record {}", table, id);
            result.skipped += 1;
            return Ok(());
        };
        let merged = self.transformer.merge_local(table, &existing.fields, remote);
        collection.update(&id, |record| overwrite(record, merged))?;
        result.updated += 1;
        Ok(())
    }

    fn apply_delete(
        collection: &mut Collection<'_>,
        id: &RecordId,
        result: &mut TableApplyResult,
    ) -> Result<()> {
        if collection.find(id)?.is_none() {
            warn!(
                "Delete of missing {} record {}, already gone",
                collection.table(),
                id
            );
            result.skipped += 1;
            return Ok(());
        }
        collection.hard_delete(id)?;
        result.deleted += 1;
        Ok(())
    }

    /// Local record sharing the natural key of `fields`, preferring dirty ones.
    fn natural_match(
        &self,
        collection: &Collection<'_>,
        fields: &EntityFields,
        only: Option<&HashSet<RecordId>>,
    ) -> Result<Option<Record>> {
        let keys = match self.natural_keys.get(&collection.table()) {
            Some(keys) if !keys.is_empty() => keys,
            _ => return Ok(None),
        };
        let mut pairs = Vec::with_capacity(keys.len());
        for key in keys {
            match fields.field(key) {
                Some(serde_json::Value::Null) | None => return Ok(None),
                Some(serde_json::Value::String(s)) if s.trim().is_empty() => return Ok(None),
                Some(value) => pairs.push((key.clone(), value)),
            }
        }

        let candidates: Vec<Record> = collection
            .query(&Predicate::NaturalKey(pairs))?
            .into_iter()
            .filter(|r| only.map_or(true, |ids| ids.contains(&r.id)))
            .collect();
        if candidates.len() > 1 {
            debug!(
                "{} local {} records share a natural key",
                candidates.len(),
                collection.table()
            );
        }
        let preferred = candidates.iter().position(Record::is_dirty).unwrap_or(0);
        Ok(candidates.into_iter().nth(preferred))
    }

    /// Move a local record to its server id; returns whether it moved.
    fn adopt_server_id(
        collection: &mut Collection<'_>,
        local: &RecordId,
        server: &RecordId,
    ) -> Result<bool> {
        if local == server {
            return Ok(false);
        }
        if collection.find(server)?.is_some() {
            warn!(
                "Cannot move {} {} to server id {}: id already taken",
                collection.table(),
                local,
                server
            );
            return Ok(false);
        }
        collection.rekey(local, server)?;
        Ok(true)
    }

    /// Clear dirty flags of records confirmed by a push.
    ///
    /// Echoed server records are located by server id first, then by natural
    /// key among the pushed records, and the local record adopts the server
    /// id. Pushed records without an echo are located by their own id. A record
    /// whose `updated_at` moved past the pushed `updatedAt` was edited during the
    /// push and stays dirty. Pushed deletions are physically removed.
    ///
    /// # Errors
    /// - The transaction cannot be opened or committed
    pub async fn mark_outbound_synced(
        &self,
        store: &dyn LocalStore,
        sent: &ChangeSet,
        echoed: &ChangeSet,
    ) -> Result<OutboundReport> {
        let mut txn = store.begin().await?;
        let mut report = OutboundReport::default();

        for (table, sent_changes) in sent.iter() {
            let mut result = MarkResult::new(table);
            let versions: HashMap<RecordId, Option<i64>> = sent_changes
                .created
                .iter()
                .chain(&sent_changes.updated)
                .filter_map(|r| {
                    r.id()
                        .map(|id| (id, r.get("updatedAt").and_then(value_as_i64)))
                })
                .collect();
            if versions.is_empty() && sent_changes.deleted.is_empty() {
                report.tables.push(result);
                continue;
            }

            let mut collection = match txn.collection(table) {
                Ok(collection) => collection,
                Err(e) => {
                    error!("Cannot open {}: {}", table, e);
                    result.errors.push(format!("{}: {}", table, e));
                    report.tables.push(result);
                    continue;
                }
            };

            let pushed: HashSet<RecordId> = versions.keys().cloned().collect();
            let mut handled = HashSet::new();
            if let Some(echo) = echoed.get(table) {
                for server in echo.created.iter().chain(&echo.updated) {
                    match self.mark_echoed(&mut collection, server, &pushed, &versions, &mut result)
                    {
                        Ok(Some(local_id)) => {
                            handled.insert(local_id);
                        }
                        Ok(None) => {}
                        Err(e) => result
                            .errors
                            .push(format!("{} {}: {}", table, describe(server), e)),
                    }
                }
            }

            for sent_record in sent_changes.created.iter().chain(&sent_changes.updated) {
                let Some(id) = sent_record.id() else { continue };
                if handled.contains(&id) {
                    continue;
                }
                if let Err(e) =
                    self.mark_sent(&mut collection, &id, sent_record, &pushed, &versions, &mut result)
                {
                    result.errors.push(format!("{} {}: {}", table, id, e));
                }
            }

            for id in &sent_changes.deleted {
                if let Err(e) = Self::purge_deleted(&mut collection, id, &mut result) {
                    result.errors.push(format!("{} {}: {}", table, id, e));
                }
            }

            debug!(
                "Marked {}: {} synced, {} re-keyed, {} still dirty, {} purged, {} not found",
                table,
                result.marked,
                result.rekeyed,
                result.still_dirty,
                result.purged,
                result.not_found
            );
            report.tables.push(result);
        }

        txn.commit()?;
        Ok(report)
    }

    /// Handle one echoed server record; returns the pushed local id it matched.
    fn mark_echoed(
        &self,
        collection: &mut Collection<'_>,
        server: &RemoteRecord,
        pushed: &HashSet<RecordId>,
        versions: &HashMap<RecordId, Option<i64>>,
        result: &mut MarkResult,
    ) -> Result<Option<RecordId>> {
        let Some(server_id) = server.id() else {
            return Ok(None);
        };
        let local = match collection.find(&server_id)? {
            Some(record) if pushed.contains(&record.id) => Some(record),
            _ => {
                let fields = self.transformer.to_local(collection.table(), server);
                self.natural_match(collection, &fields, Some(pushed))?
            }
        };
        let Some(local) = local else {
            debug!(
                "Echoed {} record {} matches nothing pushed",
                collection.table(),
                server_id
            );
            return Ok(None);
        };

        let local_id = local.id.clone();
        Self::confirm(collection, &local, versions.get(&local_id).copied().flatten(), result)?;
        if Self::adopt_server_id(collection, &local_id, &server_id)? {
            result.rekeyed += 1;
        }
        Ok(Some(local_id))
    }

    /// Handle a pushed record the server did not echo.
    fn mark_sent(
        &self,
        collection: &mut Collection<'_>,
        id: &RecordId,
        sent: &RemoteRecord,
        pushed: &HashSet<RecordId>,
        versions: &HashMap<RecordId, Option<i64>>,
        result: &mut MarkResult,
    ) -> Result<()> {
        let local = match collection.find(id)? {
            Some(record) => Some(record),
            None => {
                let fields = self.transformer.to_local(collection.table(), sent);
                self.natural_match(collection, &fields, None)?
                    .filter(|r| r.is_dirty() && !pushed.contains(&r.id))
            }
        };
        match local {
            Some(local) => Self::confirm(collection, &local, versions.get(id).copied().flatten(), result),
            None => {
                warn!(
                    "Pushed {} record {} no longer exists locally",
                    collection.table(),
                    id
                );
                result.not_found += 1;
                Ok(())
            }
        }
    }

    /// Remove a soft-deleted record whose deletion the remote store accepted.
    fn purge_deleted(
        collection: &mut Collection<'_>,
        id: &RecordId,
        result: &mut MarkResult,
    ) -> Result<()> {
        match collection.find(id)? {
            Some(record) if record.sync_status == SyncStatus::Deleted => {
                collection.hard_delete(id)?;
                result.purged += 1;
            }
            Some(_) => {
                debug!("{} {} was restored during push, keeping it", collection.table(), id);
            }
            None => {}
        }
        Ok(())
    }

    /// Clear the dirty flag unless the record changed after `sent_version`.
    fn confirm(
        collection: &mut Collection<'_>,
        local: &Record,
        sent_version: Option<i64>,
        result: &mut MarkResult,
    ) -> Result<()> {
        let edited_since = sent_version.is_some_and(|v| local.updated_at > v);
        if edited_since {
            debug!(
                "{} {} changed during push, keeping it dirty",
                collection.table(),
                local.id
            );
            if local.sync_status == SyncStatus::Created {
                // The remote store has it now; the pending edit is an update.
                collection.update(&local.id, |r| r.sync_status = SyncStatus::Updated)?;
            }
            result.still_dirty += 1;
            return Ok(());
        }
        if local.sync_status == SyncStatus::Deleted {
            result.still_dirty += 1;
            return Ok(());
        }
        collection.update(&local.id, |r| r.sync_status = SyncStatus::Synced)?;
        result.marked += 1;
        Ok(())
    }
}
