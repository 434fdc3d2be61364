//! Common utilities and types shared across fitsync modules.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the workspace error type, record identifiers, the table catalogue and the
//! typed record model that both the local store and the sync engine operate on.

pub mod coerce;
pub mod error;
pub mod record;
pub mod types;

pub use error::{Error, ErrorCategory, Result};
pub use record::{
    Client, ClientMeasurement, EntityFields, ExerciseEntry, Record, Trainer, WorkoutSession,
};
pub use types::{now_millis, RecordId, SyncStatus, Table};
