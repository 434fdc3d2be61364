//! Record transformation between the local and the remote shape.
//!
//! Locally, fields are typed structs with snake_case names. Remotely, records
//! are camelCase JSON objects carrying their own bookkeeping timestamps. Most
//! tables only need renaming; tables with a different remote layout register a
//! [`TableTransform`] override.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use fitsync_common::coerce::{millis_to_date, value_as_f64, value_as_id, value_as_millis};
use fitsync_common::{ClientMeasurement, EntityFields, Error, Record, Result, Table};

use crate::changeset::RemoteRecord;

/// Remote keys owned by the stores themselves, never copied into business fields.
const BOOKKEEPING_KEYS: [&str; 7] = [
    "id",
    "createdAt",
    "updatedAt",
    "deletedAt",
    "syncStatus",
    "_status",
    "_changed",
];

const KG_PER_POUND: f64 = 0.453_592_37;

/// Convert a local field name to the remote convention.
pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Convert a remote field name to the local convention.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn is_primitive(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

/// Remote record reduced to business fields with local names.
fn local_shape(remote: &RemoteRecord) -> Map<String, Value> {
    remote
        .fields()
        .iter()
        .filter(|(key, _)| !BOOKKEEPING_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (camel_to_snake(key), value.clone()))
        .collect()
}

/// Identity and timestamps every outbound record carries.
fn bookkeeping(record: &Record) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("id".into(), json!(record.id.as_str()));
    out.insert("createdAt".into(), json!(record.created_at));
    out.insert("updatedAt".into(), json!(record.updated_at));
    out.insert("deletedAt".into(), json!(record.deleted_at));
    out
}

/// Per-table mapping logic.
pub trait TableTransform: Send + Sync {
    /// Remote record to local fields.
    ///
    /// # Errors
    /// - The payload cannot be mapped field by field
    fn to_local(&self, table: Table, remote: &RemoteRecord) -> Result<EntityFields>;

    /// Local record to remote business fields (bookkeeping is added by the caller).
    fn to_remote(&self, record: &Record) -> Map<String, Value>;

    /// Remote record laid over the fields of an existing local record.
    ///
    /// Fields the payload does not carry keep their local value.
    ///
    /// # Errors
    /// - The payload cannot be mapped field by field
    fn merge_local(
        &self,
        table: Table,
        existing: &EntityFields,
        remote: &RemoteRecord,
    ) -> Result<EntityFields>;
}

/// Uniform renaming transform.
///
/// Outbound, only primitives and arrays of primitives are serialized; object
/// fields are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericTransform;

impl TableTransform for GenericTransform {
    fn to_local(&self, table: Table, remote: &RemoteRecord) -> Result<EntityFields> {
        EntityFields::from_map(table, local_shape(remote))
    }

    fn to_remote(&self, record: &Record) -> Map<String, Value> {
        let fields = record.fields.to_map();
        let mut out = Map::new();
        for (key, value) in &fields {
            let keep = match value {
                Value::Array(items) => items.iter().all(is_primitive),
                other => is_primitive(other),
            };
            if keep {
                out.insert(snake_to_camel(key), value.clone());
            } else {
                debug!("Dropping non-primitive field {} of {}", key, record.id);
            }
        }
        out
    }

    fn merge_local(
        &self,
        table: Table,
        existing: &EntityFields,
        remote: &RemoteRecord,
    ) -> Result<EntityFields> {
        let mut map = existing.to_map();
        map.extend(local_shape(remote));
        EntityFields::from_map(table, map)
    }
}

/// Measurement kinds with a dedicated remote column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MeasurementKind {
    Weight,
    BodyFat,
    Custom,
}

impl MeasurementKind {
    fn of(measurement_type: &str) -> Self {
        match measurement_type.trim().to_ascii_lowercase().as_str() {
            "weight" | "body_weight" => MeasurementKind::Weight,
            "body_fat" | "body_fat_percentage" | "bodyfat" => MeasurementKind::BodyFat,
            _ => MeasurementKind::Custom,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Weight in kilograms, converting from pounds when needed.
pub fn weight_in_kg(value: f64, unit: &str) -> f64 {
    match unit.trim().to_ascii_lowercase().as_str() {
        "lb" | "lbs" | "pound" | "pounds" => round2(value * KG_PER_POUND),
        _ => value,
    }
}

/// Client measurements: generic `(type, value, unit)` locally, one column per
/// metric remotely (`weightKg`, `bodyFatPercentage`, `customMetrics`).
#[derive(Debug, Default, Clone, Copy)]
pub struct MeasurementTransform;

impl MeasurementTransform {
    fn custom_metric(metrics: &Value) -> Option<(String, f64, String)> {
        let (name, entry) = metrics.as_object()?.iter().next()?;
        match entry {
            Value::Object(inner) => Some((
                name.clone(),
                inner.get("value").and_then(value_as_f64)?,
                inner
                    .get("unit")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )),
            other => Some((name.clone(), value_as_f64(other)?, String::new())),
        }
    }
}

impl TableTransform for MeasurementTransform {
    fn to_local(&self, table: Table, remote: &RemoteRecord) -> Result<EntityFields> {
        let non_null = |key: &str| remote.get(key).filter(|v| !v.is_null());
        let id_of = |key: &str| non_null(key).and_then(value_as_id);

        let (measurement_type, value, unit) = if let Some(weight) = non_null("weightKg") {
            let kg = value_as_f64(weight)
                .ok_or_else(|| Error::Serialization(format!("Bad weightKg: {}", weight)))?;
            ("weight".to_string(), kg, "kg".to_string())
        } else if let Some(fat) = non_null("bodyFatPercentage") {
            let pct = value_as_f64(fat).ok_or_else(|| {
                Error::Serialization(format!("Bad bodyFatPercentage: {}", fat))
            })?;
            ("body_fat".to_string(), pct, "%".to_string())
        } else if let Some(metrics) = non_null("customMetrics") {
            Self::custom_metric(metrics).ok_or_else(|| {
                Error::Serialization(format!("Bad customMetrics: {}", metrics))
            })?
        } else if let Some(kind) = non_null("measurementType").and_then(Value::as_str) {
            // Generic layout, as some older endpoints still send it.
            let value = non_null("value").and_then(value_as_f64).unwrap_or_default();
            let unit = non_null("unit")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (kind.to_string(), value, unit)
        } else {
            return Err(Error::Serialization(format!(
                "No metric in {} record",
                table
            )));
        };

        let measured_at = non_null("measuredDate")
            .or_else(|| non_null("measuredAt"))
            .map(|v| {
                value_as_millis(v)
                    .ok_or_else(|| Error::Serialization(format!("Bad measurement date: {}", v)))
            })
            .transpose()?
            .unwrap_or_default();

        Ok(EntityFields::ClientMeasurements(ClientMeasurement {
            client_id: id_of("clientId"),
            trainer_id: id_of("trainerId"),
            measurement_type,
            value,
            unit,
            measured_at,
            notes: non_null("notes").and_then(Value::as_str).map(String::from),
        }))
    }

    fn to_remote(&self, record: &Record) -> Map<String, Value> {
        let m = match &record.fields {
            EntityFields::ClientMeasurements(m) => m,
            _ => return GenericTransform.to_remote(record),
        };

        let mut out = Map::new();
        out.insert("clientId".into(), json!(m.client_id));
        out.insert("trainerId".into(), json!(m.trainer_id));
        out.insert("weightKg".into(), Value::Null);
        out.insert("bodyFatPercentage".into(), Value::Null);
        out.insert("customMetrics".into(), Value::Null);
        match MeasurementKind::of(&m.measurement_type) {
            MeasurementKind::Weight => {
                out.insert("weightKg".into(), json!(weight_in_kg(m.value, &m.unit)));
            }
            MeasurementKind::BodyFat => {
                out.insert("bodyFatPercentage".into(), json!(m.value));
            }
            MeasurementKind::Custom => {
                let mut metrics = Map::new();
                metrics.insert(
                    m.measurement_type.clone(),
                    json!({ "value": m.value, "unit": m.unit }),
                );
                out.insert("customMetrics".into(), Value::Object(metrics));
            }
        }
        out.insert("measuredDate".into(), json!(millis_to_date(m.measured_at)));
        out.insert("notes".into(), json!(m.notes));
        out
    }

    fn merge_local(
        &self,
        table: Table,
        existing: &EntityFields,
        remote: &RemoteRecord,
    ) -> Result<EntityFields> {
        let mut merged = match self.to_local(table, remote)? {
            EntityFields::ClientMeasurements(m) => m,
            other => return Ok(other),
        };
        let EntityFields::ClientMeasurements(current) = existing else {
            return Ok(EntityFields::ClientMeasurements(merged));
        };
        let absent = |key: &str| remote.get(key).is_none();
        if absent("clientId") {
            merged.client_id = current.client_id.clone();
        }
        if absent("trainerId") {
            merged.trainer_id = current.trainer_id.clone();
        }
        if absent("notes") {
            merged.notes = current.notes.clone();
        }
        if absent("measuredDate") && absent("measuredAt") {
            merged.measured_at = current.measured_at;
        }
        Ok(EntityFields::ClientMeasurements(merged))
    }
}

/// Bidirectional mapping between local records and remote records.
///
/// Never fails: a remote record that cannot be mapped is reduced to its
/// foreign keys and a warning is logged.
pub struct RecordTransformer {
    generic: GenericTransform,
    overrides: HashMap<Table, Box<dyn TableTransform>>,
}

impl Default for RecordTransformer {
    fn default() -> Self {
        Self::new().with_override(Table::ClientMeasurements, MeasurementTransform)
    }
}

impl RecordTransformer {
    /// Transformer without any per-table override.
    pub fn new() -> Self {
        Self {
            generic: GenericTransform,
            overrides: HashMap::new(),
        }
    }

    /// Register a per-table override.
    pub fn with_override(mut self, table: Table, transform: impl TableTransform + 'static) -> Self {
        self.overrides.insert(table, Box::new(transform));
        self
    }

    fn transform_for(&self, table: Table) -> &dyn TableTransform {
        match self.overrides.get(&table) {
            Some(transform) => transform.as_ref(),
            None => &self.generic,
        }
    }

    /// Remote record to local business fields. The remote `id` is stripped.
    pub fn to_local(&self, table: Table, remote: &RemoteRecord) -> EntityFields {
        match self.transform_for(table).to_local(table, remote) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(
                    "Falling back to minimal transform for {} record {:?}: {}",
                    table,
                    remote.id().map(|id| id.to_string()),
                    e
                );
                EntityFields::minimal(table, &local_shape(remote))
            }
        }
    }

    /// Remote record merged into the fields of an existing local record.
    ///
    /// Local-only fields, and any field the payload leaves out, survive. If the
    /// payload cannot be mapped the existing fields are kept unchanged.
    pub fn merge_local(
        &self,
        table: Table,
        existing: &EntityFields,
        remote: &RemoteRecord,
    ) -> EntityFields {
        if existing.table() != table {
            return self.to_local(table, remote);
        }
        match self.transform_for(table).merge_local(table, existing, remote) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(
                    "Keeping local fields of {} record {:?}, remote payload unusable: {}",
                    table,
                    remote.id().map(|id| id.to_string()),
                    e
                );
                existing.clone()
            }
        }
    }

    /// Local record to remote shape, including id and timestamps.
    pub fn to_remote(&self, record: &Record) -> RemoteRecord {
        let mut out = bookkeeping(record);
        out.extend(self.transform_for(record.table()).to_remote(record));
        RemoteRecord::new(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitsync_common::{Client, ExerciseEntry, RecordId, SyncStatus, WorkoutSession};

    fn record(fields: EntityFields) -> Record {
        Record {
            id: RecordId::from("tmp1"),
            fields,
            created_at: 1_000,
            updated_at: 2_000,
            deleted_at: None,
            sync_status: SyncStatus::Created,
        }
    }

    fn remote(value: Value) -> RemoteRecord {
        RemoteRecord::from_value(value).unwrap()
    }

    fn measurement(kind: &str, value: f64, unit: &str) -> Record {
        record(EntityFields::ClientMeasurements(ClientMeasurement {
            client_id: Some("c1".into()),
            measurement_type: kind.into(),
            value,
            unit: unit.into(),
            measured_at: 1_705_276_800_000,
            ..Default::default()
        }))
    }

    #[test]
    fn test_case_conversion() {
        assert_eq!(snake_to_camel("trainer_id"), "trainerId");
        assert_eq!(snake_to_camel("first_name"), "firstName");
        assert_eq!(snake_to_camel("email"), "email");
        assert_eq!(camel_to_snake("bodyFatPercentage"), "body_fat_percentage");
        assert_eq!(camel_to_snake("id"), "id");
        assert_eq!(camel_to_snake("already_snake"), "already_snake");
    }

    #[test]
    fn test_weight_in_pounds_is_converted() {
        let out = RecordTransformer::default().to_remote(&measurement("weight", 176.37, "lbs"));
        let kg = out.get("weightKg").and_then(Value::as_f64).unwrap();
        assert!((kg - 80.0).abs() < 0.01);
        assert_eq!(out.get("bodyFatPercentage"), Some(&Value::Null));
        assert_eq!(out.get("measuredDate"), Some(&json!("2024-01-15")));
        assert_eq!(out.get("clientId"), Some(&json!("c1")));
    }

    #[test]
    fn test_body_fat_and_custom_metrics() {
        let transformer = RecordTransformer::default();
        let out = transformer.to_remote(&measurement("body_fat", 18.5, "%"));
        assert_eq!(out.get("bodyFatPercentage"), Some(&json!(18.5)));
        assert_eq!(out.get("weightKg"), Some(&Value::Null));

        let out = transformer.to_remote(&measurement("waist", 82.0, "cm"));
        assert_eq!(
            out.get("customMetrics"),
            Some(&json!({ "waist": { "value": 82.0, "unit": "cm" } }))
        );
    }

    #[test]
    fn test_measurement_to_local() {
        let transformer = RecordTransformer::default();
        let fields = transformer.to_local(
            Table::ClientMeasurements,
            &remote(json!({
                "id": "m1",
                "clientId": "c1",
                "weightKg": "80.0",
                "bodyFatPercentage": null,
                "measuredDate": "2024-01-15"
            })),
        );
        match fields {
            EntityFields::ClientMeasurements(m) => {
                assert_eq!(m.measurement_type, "weight");
                assert_eq!(m.value, 80.0);
                assert_eq!(m.unit, "kg");
                assert_eq!(m.measured_at, 1_705_276_800_000);
                assert_eq!(m.client_id.as_deref(), Some("c1"));
            }
            other => panic!("wrong variant: {:?}", other),
        }

        let fields = transformer.to_local(
            Table::ClientMeasurements,
            &remote(json!({ "customMetrics": { "waist": { "value": 82, "unit": "cm" } } })),
        );
        assert_eq!(fields.field("measurement_type"), Some(json!("waist")));
        assert_eq!(fields.field("unit"), Some(json!("cm")));
    }

    #[test]
    fn test_generic_to_remote_drops_objects_and_keeps_foreign_keys() {
        let rec = record(EntityFields::Clients(Client {
            first_name: "Ada".into(),
            email: Some("a@x.com".into()),
            goals: vec!["strength".into()],
            preferences: Some(json!({ "theme": "dark" })),
            ..Default::default()
        }));
        let out = RecordTransformer::default().to_remote(&rec);
        assert_eq!(out.get("id"), Some(&json!("tmp1")));
        assert_eq!(out.get("firstName"), Some(&json!("Ada")));
        assert_eq!(out.get("goals"), Some(&json!(["strength"])));
        assert_eq!(out.get("updatedAt"), Some(&json!(2_000)));
        assert_eq!(out.get("trainerId"), Some(&Value::Null));
        assert_eq!(out.get("userId"), Some(&Value::Null));
        assert!(!out.contains("preferences"));
        assert!(!out.contains("syncStatus"));

        let session = record(EntityFields::WorkoutSessions(WorkoutSession {
            exercises: vec![ExerciseEntry {
                name: "squat".into(),
                ..Default::default()
            }],
            ..Default::default()
        }));
        let out = RecordTransformer::default().to_remote(&session);
        assert!(!out.contains("exercises"));
        assert!(out.contains("tags"));
    }

    #[test]
    fn test_generic_to_local_strips_id_and_renames() {
        let fields = RecordTransformer::default().to_local(
            Table::Clients,
            &remote(json!({
                "id": "c1",
                "trainerId": 7,
                "firstName": "Ada",
                "email": "b@x.com",
                "updatedAt": 5
            })),
        );
        match fields {
            EntityFields::Clients(c) => {
                assert_eq!(c.trainer_id.as_deref(), Some("7"));
                assert_eq!(c.first_name, "Ada");
                assert_eq!(c.email.as_deref(), Some("b@x.com"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unmappable_record_falls_back_to_minimal() {
        let transformer = RecordTransformer::default();
        let fields = transformer.to_local(
            Table::WorkoutSessions,
            &remote(json!({ "clientId": "c1", "durationMinutes": { "bad": true } })),
        );
        match fields {
            EntityFields::WorkoutSessions(w) => {
                assert_eq!(w.client_id.as_deref(), Some("c1"));
                assert_eq!(w.duration_minutes, None);
            }
            other => panic!("wrong variant: {:?}", other),
        }

        let fields = transformer.to_local(
            Table::ClientMeasurements,
            &remote(json!({ "clientId": "c1" })),
        );
        assert_eq!(fields.field("client_id"), Some(json!("c1")));
    }

    #[test]
    fn test_merge_keeps_local_only_fields() {
        let existing = EntityFields::Clients(Client {
            first_name: "Ann".into(),
            last_name: "Lee".into(),
            email: Some("a@x.com".into()),
            preferences: Some(json!({ "theme": "dark" })),
            ..Default::default()
        });
        let merged = RecordTransformer::default().merge_local(
            Table::Clients,
            &existing,
            &remote(json!({ "id": "c1", "firstName": "Annie", "email": "a@x.com" })),
        );
        match merged {
            EntityFields::Clients(c) => {
                assert_eq!(c.first_name, "Annie");
                assert_eq!(c.last_name, "Lee");
                assert_eq!(c.preferences, Some(json!({ "theme": "dark" })));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_merge_measurement_keeps_absent_columns() {
        let existing = measurement("weight", 80.0, "kg").fields;
        let existing = match existing {
            EntityFields::ClientMeasurements(mut m) => {
                m.notes = Some("fasted".into());
                EntityFields::ClientMeasurements(m)
            }
            other => other,
        };
        let merged = RecordTransformer::default().merge_local(
            Table::ClientMeasurements,
            &existing,
            &remote(json!({ "id": "m1", "weightKg": 79.5 })),
        );
        assert_eq!(merged.field("value"), Some(json!(79.5)));
        assert_eq!(merged.field("client_id"), Some(json!("c1")));
        assert_eq!(merged.field("notes"), Some(json!("fasted")));
        assert_eq!(merged.field("measured_at"), Some(json!(1_705_276_800_000_i64)));
    }

    #[test]
    fn test_merge_with_unusable_payload_keeps_existing() {
        let existing = EntityFields::WorkoutSessions(WorkoutSession {
            title: "Legs".into(),
            duration_minutes: Some(45),
            ..Default::default()
        });
        let merged = RecordTransformer::default().merge_local(
            Table::WorkoutSessions,
            &existing,
            &remote(json!({ "id": "w1", "durationMinutes": { "bad": true } })),
        );
        assert_eq!(merged, existing);
    }
}
