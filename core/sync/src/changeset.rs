//! Change sets exchanged with the remote store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use fitsync_common::{coerce::value_as_id, RecordId, Table};

/// A record in remote (camelCase) shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRecord(Map<String, Value>);

impl RemoteRecord {
    /// Wrap a remote-shaped field map.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wrap a JSON value if it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Record id, accepting string or numeric ids.
    pub fn id(&self) -> Option<RecordId> {
        self.0.get("id").and_then(value_as_id).map(RecordId::from)
    }

    /// Field by remote name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether a field is present (even if null).
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Set a field.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Borrow the field map.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Take the field map.
    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for RemoteRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Changes of a single table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableChanges {
    pub created: Vec<RemoteRecord>,
    pub updated: Vec<RemoteRecord>,
    pub deleted: Vec<RecordId>,
}

impl TableChanges {
    /// Whether all three lists are empty.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Table-keyed bundle of created, updated and deleted records.
///
/// Sparse: tables without changes are never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(BTreeMap<Table, TableChanges>);

impl ChangeSet {
    /// Create an empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table's changes; empty changes are dropped.
    pub fn insert(&mut self, table: Table, changes: TableChanges) {
        if changes.is_empty() {
            self.0.remove(&table);
        } else {
            self.0.insert(table, changes);
        }
    }

    /// Changes of a table, if any.
    pub fn get(&self, table: Table) -> Option<&TableChanges> {
        self.0.get(&table)
    }

    /// Tables with changes, in sync order.
    pub fn iter(&self) -> impl Iterator<Item = (Table, &TableChanges)> {
        self.0.iter().map(|(table, changes)| (*table, changes))
    }

    /// Tables with changes.
    pub fn tables(&self) -> Vec<Table> {
        self.0.keys().copied().collect()
    }

    /// Whether no table has changes.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(TableChanges::is_empty)
    }

    /// Total number of entries over all tables.
    pub fn len(&self) -> usize {
        self.0.values().map(TableChanges::len).sum()
    }

    /// Wire representation (`{table: {created, updated, deleted}}`).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Opaque pull cursor handed out by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wrap a stored cursor token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Read a cursor from a wire value; numeric timestamps are stringified.
    pub fn from_value(value: &Value) -> Option<Self> {
        value_as_id(value).map(Self)
    }

    /// Token as sent back to the remote store.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_record_ids() {
        let record = RemoteRecord::from_value(json!({ "id": 42, "email": "a@x.com" })).unwrap();
        assert_eq!(record.id(), Some(RecordId::from("42")));
        let record = RemoteRecord::from_value(json!({ "id": "" })).unwrap();
        assert_eq!(record.id(), None);
        assert!(RemoteRecord::from_value(json!([1, 2])).is_none());
    }

    #[test]
    fn test_change_set_is_sparse() {
        let mut changes = ChangeSet::new();
        changes.insert(Table::Clients, TableChanges::default());
        assert!(changes.is_empty());
        assert!(changes.get(Table::Clients).is_none());

        changes.insert(
            Table::Clients,
            TableChanges {
                deleted: vec![RecordId::from("c1")],
                ..Default::default()
            },
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.tables(), vec![Table::Clients]);
    }

    #[test]
    fn test_wire_shape() {
        let mut changes = ChangeSet::new();
        changes.insert(
            Table::ClientMeasurements,
            TableChanges {
                created: vec![RemoteRecord::from_value(json!({ "id": "m1" })).unwrap()],
                ..Default::default()
            },
        );
        assert_eq!(
            changes.to_value(),
            json!({
                "client_measurements": {
                    "created": [{ "id": "m1" }],
                    "updated": [],
                    "deleted": []
                }
            })
        );
    }

    #[test]
    fn test_cursor_from_number() {
        assert_eq!(
            Cursor::from_value(&json!(1_700_000_000_000_i64)).unwrap().as_str(),
            "1700000000000"
        );
        assert!(Cursor::from_value(&json!(null)).is_none());
    }
}
