//! Typed record model shared by the local store and the sync engine.
//!
//! Every synchronized table has its own field struct. `EntityFields` is the
//! tagged union over them, so per-table logic is matched exhaustively instead
//! of iterating over untyped key sets.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::coerce::{
    lenient_bool, lenient_f64, lenient_millis, lenient_opt_i64, lenient_opt_id,
    lenient_opt_millis, value_as_id,
};
use crate::types::{RecordId, SyncStatus, Table};
use crate::{Error, Result};

/// Trainer profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trainer {
    #[serde(deserialize_with = "lenient_opt_id")]
    pub user_id: Option<String>,
    pub display_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub bio: Option<String>,
    pub specialties: Vec<String>,
}

/// A client coached by a trainer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Client {
    #[serde(deserialize_with = "lenient_opt_id")]
    pub trainer_id: Option<String>,
    #[serde(deserialize_with = "lenient_opt_id")]
    pub user_id: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub goals: Vec<String>,
    #[serde(deserialize_with = "lenient_bool")]
    pub active: bool,
    /// Local-only UI preferences; never sent to the remote store.
    pub preferences: Option<Value>,
}

/// A single body measurement.
///
/// Stored generically as `(measurement_type, value, unit)`; the remote API
/// uses type-specific columns instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientMeasurement {
    #[serde(deserialize_with = "lenient_opt_id")]
    pub client_id: Option<String>,
    #[serde(deserialize_with = "lenient_opt_id")]
    pub trainer_id: Option<String>,
    pub measurement_type: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub value: f64,
    pub unit: String,
    #[serde(deserialize_with = "lenient_millis")]
    pub measured_at: i64,
    pub notes: Option<String>,
}

/// One exercise inside a workout session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExerciseEntry {
    pub name: String,
    pub sets: u32,
    pub reps: u32,
    pub weight_kg: Option<f64>,
}

/// A scheduled or completed workout session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkoutSession {
    #[serde(deserialize_with = "lenient_opt_id")]
    pub trainer_id: Option<String>,
    #[serde(deserialize_with = "lenient_opt_id")]
    pub client_id: Option<String>,
    pub title: String,
    #[serde(deserialize_with = "lenient_opt_millis")]
    pub scheduled_at: Option<i64>,
    #[serde(deserialize_with = "lenient_opt_i64")]
    pub duration_minutes: Option<i64>,
    #[serde(deserialize_with = "lenient_bool")]
    pub completed: bool,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    /// Structured plan kept locally; the remote store has its own exercise table.
    pub exercises: Vec<ExerciseEntry>,
}

/// Business fields of a record, one arm per table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "fields", rename_all = "snake_case")]
pub enum EntityFields {
    Trainers(Trainer),
    Clients(Client),
    ClientMeasurements(ClientMeasurement),
    WorkoutSessions(WorkoutSession),
}

const FOREIGN_KEYS: [&str; 3] = ["client_id", "trainer_id", "user_id"];

impl EntityFields {
    /// Table this variant belongs to.
    pub fn table(&self) -> Table {
        match self {
            EntityFields::Trainers(_) => Table::Trainers,
            EntityFields::Clients(_) => Table::Clients,
            EntityFields::ClientMeasurements(_) => Table::ClientMeasurements,
            EntityFields::WorkoutSessions(_) => Table::WorkoutSessions,
        }
    }

    /// Default (empty) fields for a table.
    pub fn empty(table: Table) -> Self {
        match table {
            Table::Trainers => EntityFields::Trainers(Trainer::default()),
            Table::Clients => EntityFields::Clients(Client::default()),
            Table::ClientMeasurements => {
                EntityFields::ClientMeasurements(ClientMeasurement::default())
            }
            Table::WorkoutSessions => EntityFields::WorkoutSessions(WorkoutSession::default()),
        }
    }

    /// Build typed fields from a map keyed by local (snake_case) field names.
    ///
    /// Unknown keys are ignored; missing keys take their defaults.
    ///
    /// # Errors
    /// - A known field holds a value that cannot be coerced to its type
    pub fn from_map(table: Table, map: Map<String, Value>) -> Result<Self> {
        let value = Value::Object(map);
        let fields = match table {
            Table::Trainers => EntityFields::Trainers(serde_json::from_value(value)?),
            Table::Clients => EntityFields::Clients(serde_json::from_value(value)?),
            Table::ClientMeasurements => {
                EntityFields::ClientMeasurements(serde_json::from_value(value)?)
            }
            Table::WorkoutSessions => EntityFields::WorkoutSessions(serde_json::from_value(value)?),
        };
        Ok(fields)
    }

    /// Fields carrying nothing but the foreign keys found in `map`.
    ///
    /// Used when a payload cannot be mapped field by field.
    pub fn minimal(table: Table, map: &Map<String, Value>) -> Self {
        let keys: Map<String, Value> = FOREIGN_KEYS
            .iter()
            .filter_map(|key| {
                map.get(*key)
                    .and_then(value_as_id)
                    .map(|id| (key.to_string(), Value::String(id)))
            })
            .collect();
        Self::from_map(table, keys).unwrap_or_else(|_| Self::empty(table))
    }

    /// Fields as a map keyed by local (snake_case) field names.
    pub fn to_map(&self) -> Map<String, Value> {
        let value = match self {
            EntityFields::Trainers(f) => serde_json::to_value(f),
            EntityFields::Clients(f) => serde_json::to_value(f),
            EntityFields::ClientMeasurements(f) => serde_json::to_value(f),
            EntityFields::WorkoutSessions(f) => serde_json::to_value(f),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Serialize the inner struct only (the table is stored alongside).
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&Value::Object(self.to_map())).map_err(Error::from)
    }

    /// Inverse of [`EntityFields::to_json`].
    pub fn from_json(table: Table, json: &str) -> Result<Self> {
        match serde_json::from_str(json)? {
            Value::Object(map) => Self::from_map(table, map),
            other => Err(Error::Serialization(format!(
                "Expected an object for {} fields, got {}",
                table, other
            ))),
        }
    }

    /// Look up a single field by its local name.
    pub fn field(&self, name: &str) -> Option<Value> {
        self.to_map().remove(name)
    }
}

/// A record in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub fields: EntityFields,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub sync_status: SyncStatus,
}

impl Record {
    /// Table the record lives in.
    pub fn table(&self) -> Table {
        self.fields.table()
    }

    /// Whether the record has an unconfirmed local mutation.
    pub fn is_dirty(&self) -> bool {
        self.sync_status.is_dirty()
    }

    /// Look up a business field by its local name.
    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.field(name)
    }
}
