//! Sync coordination: one pull-then-push run at a time.
//!
//! The coordinator owns the sync state machine. A run pulls and applies remote
//! changes, advances the cursor, then collects, pushes and marks local
//! changes. A failing pull skips the push; the next trigger starts over.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fitsync_common::{now_millis, Error, Result, Table};
use fitsync_storage::{KeyValueStore, LocalStore};

use crate::apply::{ChangeApplier, InboundReport, OutboundReport};
use crate::changeset::Cursor;
use crate::client::RemoteSyncClient;
use crate::collect::ChangeCollector;
use crate::config::SyncConfig;
use crate::cursor::SyncCursor;
use crate::state::{SyncSnapshot, SyncState};
use crate::transform::RecordTransformer;
use crate::transport::RemoteTransport;

/// Phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// Cursor lookup, pull, inbound apply, cursor advance.
    Pull,
    /// Collection, validation, push, mark-synced.
    Push,
    /// Failure outside a known phase (a panic).
    Unknown,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncPhase::Pull => "pull",
            SyncPhase::Push => "push",
            SyncPhase::Unknown => "unknown",
        })
    }
}

/// Why a trigger did not start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another run is in progress.
    InProgress,
    /// Connectivity is down.
    Offline,
    /// The previous run started less than the minimum interval ago.
    TooSoon,
    /// The scheduler is stopping.
    ShuttingDown,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::InProgress => "sync already in progress",
            SkipReason::Offline => "offline",
            SkipReason::TooSoon => "minimum sync interval not elapsed",
            SkipReason::ShuttingDown => "scheduler shutting down",
        })
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Per-table inbound results.
    pub inbound: InboundReport,
    /// Number of entries transmitted by the push.
    pub pushed: usize,
    /// Per-table mark-synced results.
    pub outbound: OutboundReport,
    /// Validation warnings of both directions.
    pub warnings: Vec<String>,
    /// Cursor the pull started from.
    pub cursor_before: Option<Cursor>,
    /// Cursor stored after the pull.
    pub cursor_after: Option<Cursor>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

/// Result of a trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The run finished both phases.
    Completed(SyncReport),
    /// No run was started.
    Skipped(SkipReason),
    /// The run failed.
    Failed { phase: SyncPhase, message: String },
}

impl SyncOutcome {
    /// Whether a run completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }

    /// Report of a completed run.
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Holds the in-progress flag for the lifetime of a run.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "sync run panicked".to_string()
    }
}

type PhaseResult<T> = std::result::Result<T, (SyncPhase, Error)>;

fn in_phase(phase: SyncPhase) -> impl FnOnce(Error) -> (SyncPhase, Error) {
    move |e| (phase, e)
}

/// Drives sync runs between the local store and the remote store.
pub struct SyncCoordinator {
    store: Arc<dyn LocalStore>,
    client: RemoteSyncClient,
    collector: ChangeCollector,
    applier: ChangeApplier,
    cursor: SyncCursor,
    tables: Vec<Table>,
    min_interval: Duration,
    running: AtomicBool,
    online: AtomicBool,
    last_run: Mutex<Option<Instant>>,
    status: watch::Sender<SyncSnapshot>,
}

impl SyncCoordinator {
    /// Create a coordinator with the default record transformer.
    pub fn new(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn RemoteTransport>,
        kv: Arc<dyn KeyValueStore>,
        config: &SyncConfig,
    ) -> Self {
        Self::with_transformer(
            store,
            transport,
            kv,
            config,
            Arc::new(RecordTransformer::default()),
        )
    }

    /// Create a coordinator with a custom record transformer.
    pub fn with_transformer(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn RemoteTransport>,
        kv: Arc<dyn KeyValueStore>,
        config: &SyncConfig,
        transformer: Arc<RecordTransformer>,
    ) -> Self {
        let (status, _) = watch::channel(SyncSnapshot::default());
        Self {
            store,
            client: RemoteSyncClient::new(transport, config),
            collector: ChangeCollector::new(transformer.clone()),
            applier: ChangeApplier::new(transformer, &config.tables),
            cursor: SyncCursor::new(kv),
            tables: config.table_names(),
            min_interval: config.min_sync_interval(),
            running: AtomicBool::new(false),
            online: AtomicBool::new(true),
            last_run: Mutex::new(None),
            status,
        }
    }

    /// Current status.
    pub fn status(&self) -> SyncSnapshot {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.status.subscribe()
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run after a natural trigger.
    ///
    /// Skipped while offline, while another run is in progress, or when the
    /// previous run started less than the minimum interval ago.
    pub async fn sync(&self) -> SyncOutcome {
        if !self.online.load(Ordering::Acquire) {
            debug!("Offline, skipping sync");
            return SyncOutcome::Skipped(SkipReason::Offline);
        }
        let state = self.status.borrow().state;
        if !state.can_start_sync() {
            debug!("Sync state is {}, dropping trigger", state);
            return SyncOutcome::Skipped(if state == SyncState::Offline {
                SkipReason::Offline
            } else {
                SkipReason::InProgress
            });
        }
        let last_run = *self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = last_run {
            if last.elapsed() < self.min_interval {
                debug!("Last sync {:?} ago, skipping", last.elapsed());
                return SyncOutcome::Skipped(SkipReason::TooSoon);
            }
        }
        self.run_guarded().await
    }

    /// Run now, ignoring the minimum interval and connectivity.
    ///
    /// Still dropped if another run is in progress.
    pub async fn force_sync(&self) -> SyncOutcome {
        self.run_guarded().await
    }

    /// Connectivity edge. Going online triggers a sync.
    pub async fn on_connectivity_changed(&self, connected: bool) -> SyncOutcome {
        let was_online = self.online.swap(connected, Ordering::AcqRel);
        if !connected {
            if was_online {
                info!("Connectivity lost");
            }
            self.update(|s| s.state = SyncState::Offline);
            return SyncOutcome::Skipped(SkipReason::Offline);
        }

        if !was_online {
            info!("Connectivity restored");
            let running = self.is_running();
            self.update(|s| {
                s.state = if running {
                    SyncState::Syncing
                } else if s.last_error.is_some() {
                    SyncState::Error
                } else {
                    SyncState::Idle
                };
            });
        }
        self.sync().await
    }

    /// The application came to the foreground.
    pub async fn on_app_foreground(&self) -> SyncOutcome {
        debug!("App foregrounded");
        self.sync().await
    }

    /// Forget the pull cursor so the next run resynchronizes everything.
    ///
    /// # Errors
    /// - The cursor store cannot be written
    pub async fn reset(&self) -> Result<()> {
        if self.is_running() {
            warn!("Resetting the cursor while a sync is in progress");
        }
        self.cursor.reset().await
    }

    /// Stored pull cursor.
    ///
    /// # Errors
    /// - The cursor store cannot be read
    pub async fn cursor(&self) -> Result<Option<Cursor>> {
        self.cursor.get().await
    }

    fn update(&self, f: impl FnOnce(&mut SyncSnapshot)) {
        let online = self.online.load(Ordering::Acquire);
        self.status.send_modify(|snapshot| {
            f(snapshot);
            if !online {
                snapshot.state = SyncState::Offline;
            }
        });
    }

    async fn run_guarded(&self) -> SyncOutcome {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("Sync already in progress, dropping trigger");
            return SyncOutcome::Skipped(SkipReason::InProgress);
        };
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.update(|s| s.state = SyncState::Syncing);

        info!("Sync started");
        let started = Instant::now();
        let result = AssertUnwindSafe(self.run()).catch_unwind().await;

        match result {
            Ok(Ok(mut report)) => {
                report.duration = started.elapsed();
                info!(
                    "Sync completed in {:?}: {} pushed, {} marked synced",
                    report.duration,
                    report.pushed,
                    report.outbound.marked()
                );
                let snapshot_report = report.clone();
                self.update(|s| {
                    s.state = SyncState::Idle;
                    s.last_synced_at = Some(now_millis());
                    s.last_error = None;
                    s.last_report = Some(snapshot_report);
                });
                SyncOutcome::Completed(report)
            }
            Ok(Err((phase, e))) => {
                error!("Sync failed during {}: {}", phase, e);
                self.fail(phase, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!("Sync panicked: {}", message);
                self.fail(SyncPhase::Unknown, message)
            }
        }
    }

    fn fail(&self, phase: SyncPhase, message: String) -> SyncOutcome {
        let last_error = message.clone();
        self.update(|s| {
            s.state = SyncState::Error;
            s.last_error = Some(last_error);
        });
        SyncOutcome::Failed { phase, message }
    }

    async fn run(&self) -> PhaseResult<SyncReport> {
        let mut report = SyncReport::default();

        let cursor_before = self.cursor.get().await.map_err(in_phase(SyncPhase::Pull))?;
        let pulled = self
            .client
            .pull(cursor_before.as_ref())
            .await
            .map_err(in_phase(SyncPhase::Pull))?;
        report.warnings.extend(pulled.warnings);

        let inbound = self
            .applier
            .apply_inbound(&*self.store, &pulled.changes)
            .await
            .map_err(in_phase(SyncPhase::Pull))?;
        if !inbound.committed {
            return Err((
                SyncPhase::Pull,
                Error::Storage(format!(
                    "Inbound changes rolled back: {}",
                    inbound.errors().join("; ")
                )),
            ));
        }
        report.inbound = inbound;

        if let Some(cursor) = &pulled.cursor {
            self.cursor
                .set(cursor)
                .await
                .map_err(in_phase(SyncPhase::Pull))?;
        }
        report.cursor_after = pulled.cursor.or_else(|| cursor_before.clone());
        report.cursor_before = cursor_before;

        let outbound = self
            .collector
            .collect(&*self.store, &self.tables)
            .await
            .map_err(in_phase(SyncPhase::Push))?;
        if outbound.is_empty() {
            debug!("No local changes to push");
            return Ok(report);
        }

        let ack = self
            .client
            .push(&outbound)
            .await
            .map_err(in_phase(SyncPhase::Push))?;
        report.warnings.extend(ack.warnings.iter().cloned());
        report.pushed = ack.sent.len();
        if !ack.is_empty() {
            report.outbound = self
                .applier
                .mark_outbound_synced(&*self.store, &ack.sent, &ack.echoed)
                .await
                .map_err(in_phase(SyncPhase::Push))?;
            for e in report.outbound.errors() {
                warn!("Mark synced: {}", e);
            }
        }
        Ok(report)
    }
}
