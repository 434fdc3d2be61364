//! Process-wide sync state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::coordinator::SyncReport;

/// Coarse state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Waiting for a trigger.
    #[default]
    Idle,
    /// A run is in progress.
    Syncing,
    /// Connectivity is down; overrides every other state.
    Offline,
    /// The last run failed.
    Error,
}

impl SyncState {
    /// Whether a natural trigger may start a run.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Error)
    }

    /// Lowercase name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Offline => "offline",
            SyncState::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable status of the sync engine.
#[derive(Debug, Clone, Default)]
pub struct SyncSnapshot {
    /// Current state.
    pub state: SyncState,
    /// Epoch millis of the last successful run.
    pub last_synced_at: Option<i64>,
    /// Message of the last failed run; cleared by the next success.
    pub last_error: Option<String>,
    /// Summary of the last completed run.
    pub last_report: Option<SyncReport>,
}

impl SyncSnapshot {
    /// Whether connectivity is down.
    pub fn is_offline(&self) -> bool {
        self.state == SyncState::Offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_start_sync() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(SyncState::Error.can_start_sync());
        assert!(!SyncState::Syncing.can_start_sync());
        assert!(!SyncState::Offline.can_start_sync());
    }

    #[test]
    fn test_default_snapshot() {
        let snapshot = SyncSnapshot::default();
        assert_eq!(snapshot.state, SyncState::Idle);
        assert!(snapshot.last_error.is_none());
        assert_eq!(serde_json::to_string(&SyncState::Offline).unwrap(), "\"offline\"");
    }
}
