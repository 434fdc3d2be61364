//! Structural validation and sanitization of change sets.
//!
//! Bad individual records are dropped with a warning; only a malformed table
//! or top-level structure invalidates the whole batch.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use fitsync_common::{coerce::value_as_id, Error, RecordId, Result, Table};

use crate::changeset::{ChangeSet, RemoteRecord, TableChanges};
use crate::config::TableConfig;

/// Warning reported for a change set without any entry.
pub const NOTHING_TO_SYNC: &str = "No changes to sync";

/// Outcome of validating a change set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    /// False only for structural malformation.
    pub is_valid: bool,
    /// Structural errors.
    pub errors: Vec<String>,
    /// Dropped records, missing expected fields, empty input.
    pub warnings: Vec<String>,
    /// Records that passed validation; `None` when invalid.
    pub data: Option<ChangeSet>,
}

impl ValidationResult {
    fn invalid(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
            warnings,
            data: None,
        }
    }

    /// Valid subset and warnings, or the structural errors.
    pub fn into_result(self) -> Result<(ChangeSet, Vec<String>)> {
        match self.data {
            Some(data) if self.is_valid => Ok((data, self.warnings)),
            _ => Err(Error::Validation(self.errors)),
        }
    }
}

/// Validates change sets before they are transmitted or applied.
#[derive(Debug, Clone, Default)]
pub struct ChangeValidator {
    expected_fields: HashMap<Table, Vec<String>>,
}

impl ChangeValidator {
    /// Validator checking the expected fields of each configured table.
    pub fn new(tables: &[TableConfig]) -> Self {
        Self {
            expected_fields: tables
                .iter()
                .map(|t| (t.table, t.expected_fields.clone()))
                .collect(),
        }
    }

    /// Validator checking structure only.
    pub fn structural() -> Self {
        Self::default()
    }

    /// Validate a wire change set (`{table: {created, updated, deleted}}`).
    pub fn validate(&self, changes: &Value) -> ValidationResult {
        let tables = match changes {
            Value::Object(tables) => tables,
            Value::Null => {
                return ValidationResult::invalid(vec!["Change set is null".to_string()], vec![])
            }
            other => {
                return ValidationResult::invalid(
                    vec![format!("Change set must be an object, got {}", type_name(other))],
                    vec![],
                )
            }
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut data = ChangeSet::new();
        let mut seen_entries = false;

        for (name, table_changes) in tables {
            let table = match name.parse::<Table>() {
                Ok(table) => table,
                Err(_) => {
                    warn!("Ignoring changes for unknown table {}", name);
                    warnings.push(format!("Unknown table {} ignored", name));
                    continue;
                }
            };
            let table_changes = match table_changes {
                Value::Null => continue,
                Value::Object(map) => map,
                other => {
                    errors.push(format!(
                        "{}: changes must be an object, got {}",
                        table,
                        type_name(other)
                    ));
                    continue;
                }
            };

            let mut ids = HashSet::new();
            let mut out = TableChanges::default();
            for kind in ["created", "updated"] {
                match table_changes.get(kind) {
                    None | Some(Value::Null) => {}
                    Some(Value::Array(items)) => {
                        seen_entries |= !items.is_empty();
                        let records = items
                            .iter()
                            .enumerate()
                            .filter_map(|(i, item)| {
                                self.check_record(table, kind, i, item, &mut ids, &mut warnings)
                            })
                            .collect();
                        if kind == "created" {
                            out.created = records;
                        } else {
                            out.updated = records;
                        }
                    }
                    Some(other) => errors.push(format!(
                        "{}.{} must be an array, got {}",
                        table,
                        kind,
                        type_name(other)
                    )),
                }
            }
            match table_changes.get("deleted") {
                None | Some(Value::Null) => {}
                Some(Value::Array(items)) => {
                    seen_entries |= !items.is_empty();
                    let mut deleted_ids = HashSet::new();
                    for (i, item) in items.iter().enumerate() {
                        match item.as_str().map(str::trim) {
                            Some(id) if !id.is_empty() => {
                                if deleted_ids.insert(id.to_string()) {
                                    out.deleted.push(RecordId::from(id));
                                } else {
                                    warnings.push(format!(
                                        "{}.deleted[{}]: duplicate id {} dropped",
                                        table, i, id
                                    ));
                                }
                            }
                            _ => warnings.push(format!(
                                "{}.deleted[{}]: expected a non-empty string id, dropped",
                                table, i
                            )),
                        }
                    }
                }
                Some(other) => errors.push(format!(
                    "{}.deleted must be an array, got {}",
                    table,
                    type_name(other)
                )),
            }

            data.insert(table, out);
        }

        if !errors.is_empty() {
            warn!("Change set rejected: {}", errors.join("; "));
            return ValidationResult::invalid(errors, warnings);
        }
        if !seen_entries {
            warnings.push(NOTHING_TO_SYNC.to_string());
        }
        debug!(
            "Validated {} entries over {} tables ({} warnings)",
            data.len(),
            data.tables().len(),
            warnings.len()
        );
        ValidationResult {
            is_valid: true,
            errors,
            warnings,
            data: Some(data),
        }
    }

    /// Validate an already typed change set (outbound path).
    pub fn validate_change_set(&self, changes: &ChangeSet) -> ValidationResult {
        self.validate(&changes.to_value())
    }

    fn check_record(
        &self,
        table: Table,
        kind: &str,
        index: usize,
        item: &Value,
        ids: &mut HashSet<RecordId>,
        warnings: &mut Vec<String>,
    ) -> Option<RemoteRecord> {
        let record = match RemoteRecord::from_value(item.clone()) {
            Some(record) => record,
            None => {
                warnings.push(format!(
                    "{}.{}[{}]: expected an object, got {}, dropped",
                    table,
                    kind,
                    index,
                    type_name(item)
                ));
                return None;
            }
        };
        let id = match record.get("id") {
            Some(v @ (Value::String(_) | Value::Number(_))) => value_as_id(v).map(RecordId::from),
            _ => None,
        };
        let id = match id {
            Some(id) => id,
            None => {
                warnings.push(format!(
                    "{}.{}[{}]: missing or invalid id, dropped",
                    table, kind, index
                ));
                return None;
            }
        };
        if !ids.insert(id.clone()) {
            warnings.push(format!(
                "{}.{}[{}]: duplicate id {} dropped",
                table, kind, index, id
            ));
            return None;
        }

        if let Some(expected) = self.expected_fields.get(&table) {
            for field in expected {
                if record.get(field).map_or(true, Value::is_null) {
                    warnings.push(format!("{}.{} {}: missing {}", table, kind, id, field));
                }
            }
        }
        Some(record)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
