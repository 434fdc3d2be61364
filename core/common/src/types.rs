//! Common types used throughout fitsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Identifier of a record, either server-assigned or generated locally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new RecordId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "RecordId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a temporary local id for a record that has not reached the server yet.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Per-record synchronization state.
///
/// Anything other than `Synced` marks a local mutation the remote store has
/// not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No outstanding local mutation.
    #[default]
    Synced,
    /// Created locally, never pushed.
    Created,
    /// Changed locally since the last confirmed push.
    Updated,
    /// Soft-deleted locally, pending remote confirmation.
    Deleted,
}

impl SyncStatus {
    /// Wire/storage name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Created => "created",
            SyncStatus::Updated => "updated",
            SyncStatus::Deleted => "deleted",
        }
    }

    /// Whether the record carries a pending local mutation.
    pub fn is_dirty(&self) -> bool {
        *self != SyncStatus::Synced
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "created" => Ok(SyncStatus::Created),
            "updated" => Ok(SyncStatus::Updated),
            "deleted" => Ok(SyncStatus::Deleted),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown sync status: {}",
                other
            ))),
        }
    }
}

/// Entity tables kept in sync with the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Trainer profiles.
    Trainers,
    /// Clients coached by a trainer.
    Clients,
    /// Body measurements recorded for a client.
    ClientMeasurements,
    /// Scheduled or completed workout sessions.
    WorkoutSessions,
}

impl Table {
    /// Every synchronized table, in sync order.
    pub const ALL: [Table; 4] = [
        Table::Trainers,
        Table::Clients,
        Table::ClientMeasurements,
        Table::WorkoutSessions,
    ];

    /// Wire name of the table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Trainers => "trainers",
            Table::Clients => "clients",
            Table::ClientMeasurements => "client_measurements",
            Table::WorkoutSessions => "workout_sessions",
        }
    }

    /// Local field names that identify the same real-world entity across ids.
    pub fn default_natural_keys(&self) -> &'static [&'static str] {
        match self {
            Table::Trainers | Table::Clients => &["email"],
            Table::ClientMeasurements | Table::WorkoutSessions => &[],
        }
    }

    /// Remote foreign-key fields every outbound record of this table should carry.
    pub fn default_expected_fields(&self) -> &'static [&'static str] {
        match self {
            Table::Trainers => &["userId"],
            Table::Clients => &["trainerId"],
            Table::ClientMeasurements => &["clientId"],
            Table::WorkoutSessions => &["clientId", "trainerId"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Table::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown table: {}", s)))
    }
}
