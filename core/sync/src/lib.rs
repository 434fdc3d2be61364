//! fitsync Sync Engine
//!
//! This module keeps the local store and the remote store in step, including:
//! - Pull-then-push runs guarded against reentrancy
//! - Per-table record transformation between local and wire shapes
//! - Change set validation that drops bad records individually
//! - Natural-key reconciliation of locally created records
//! - A persistent pull cursor advanced only after a clean apply
//! - Event-driven and periodic scheduling

pub mod apply;
pub mod changeset;
pub mod client;
pub mod collect;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod scheduler;
pub mod state;
pub mod transform;
pub mod transport;
pub mod validate;

// Re-export main types
pub use apply::{ChangeApplier, InboundReport, MarkResult, OutboundReport, TableApplyResult};
pub use changeset::{ChangeSet, Cursor, RemoteRecord, TableChanges};
pub use client::{PullOutcome, PushAck, RemoteSyncClient};
pub use collect::ChangeCollector;
pub use config::{SyncConfig, SyncMode, TableConfig};
pub use coordinator::{SkipReason, SyncCoordinator, SyncOutcome, SyncPhase, SyncReport};
pub use cursor::SyncCursor;
pub use scheduler::{dispatch, SyncScheduler, SyncSchedulerHandle, SyncTrigger};
pub use state::{SyncSnapshot, SyncState};
pub use transform::{RecordTransformer, TableTransform};
pub use transport::{HttpTransport, MockTransport, RemoteResponse, RemoteTransport};
pub use validate::{ChangeValidator, ValidationResult};
