//! Sync scheduling - event triggers and periodic mode.

use futures::{Stream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use fitsync_common::{Error, Result};

use crate::config::SyncMode;
use crate::coordinator::{SkipReason, SyncCoordinator, SyncOutcome};

/// Event that may start a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Connectivity went up or down.
    ConnectivityChanged(bool),
    /// The application came to the foreground.
    AppForeground,
    /// Periodic tick.
    Periodic,
    /// Explicit user request.
    Force,
    /// Stop the scheduler.
    Shutdown,
}

/// Route a trigger to the matching coordinator entry point.
pub async fn dispatch(coordinator: &SyncCoordinator, trigger: SyncTrigger) -> SyncOutcome {
    match trigger {
        SyncTrigger::ConnectivityChanged(connected) => {
            coordinator.on_connectivity_changed(connected).await
        }
        SyncTrigger::AppForeground => coordinator.on_app_foreground().await,
        SyncTrigger::Periodic => coordinator.sync().await,
        SyncTrigger::Force => coordinator.force_sync().await,
        SyncTrigger::Shutdown => SyncOutcome::Skipped(SkipReason::ShuttingDown),
    }
}

/// Sender side of the scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    /// Current sync mode.
    mode: Arc<RwLock<SyncMode>>,
    /// Channel to send triggers.
    trigger_tx: mpsc::Sender<SyncTrigger>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            trigger_tx,
        };
        let handle = SyncSchedulerHandle {
            mode,
            trigger_rx: Some(trigger_rx),
        };

        (scheduler, handle)
    }

    /// Send a trigger to the scheduler loop.
    ///
    /// # Errors
    /// - The scheduler loop has stopped
    pub async fn trigger(&self, trigger: SyncTrigger) -> Result<()> {
        self.trigger_tx
            .send(trigger)
            .await
            .map_err(|_| Error::InvalidInput("Sync scheduler is not running".to_string()))
    }

    /// Report a connectivity edge.
    pub async fn connectivity_changed(&self, connected: bool) -> Result<()> {
        self.trigger(SyncTrigger::ConnectivityChanged(connected)).await
    }

    /// Report that the application came to the foreground.
    pub async fn app_foreground(&self) -> Result<()> {
        self.trigger(SyncTrigger::AppForeground).await
    }

    /// Request an immediate run.
    pub async fn force(&self) -> Result<()> {
        self.trigger(SyncTrigger::Force).await
    }

    /// Pump a stream of triggers (e.g. an OS connectivity feed) into the scheduler.
    ///
    /// The returned task ends when the stream ends or the scheduler stops.
    pub fn forward<S>(&self, stream: S) -> JoinHandle<()>
    where
        S: Stream<Item = SyncTrigger> + Send + 'static,
    {
        let tx = self.trigger_tx.clone();
        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(trigger) = stream.next().await {
                if tx.send(trigger).await.is_err() {
                    debug!("Scheduler stopped, no longer forwarding triggers");
                    break;
                }
            }
        })
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        let mut current_mode = self.mode.write().await;
        *current_mode = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the scheduler once in-flight runs finish.
    pub async fn shutdown(&self) {
        let _ = self.trigger_tx.send(SyncTrigger::Shutdown).await;
    }
}

/// Loop side of the scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    trigger_rx: Option<mpsc::Receiver<SyncTrigger>>,
}

impl SyncSchedulerHandle {
    /// Drive a coordinator until shutdown.
    pub async fn run_with(self, coordinator: Arc<SyncCoordinator>) {
        self.run(move |trigger| {
            let coordinator = coordinator.clone();
            async move { dispatch(&coordinator, trigger).await }
        })
        .await
    }

    /// Run the scheduler loop.
    ///
    /// Each trigger is handed to `sync_fn` in its own task, so a trigger that
    /// arrives during a run reaches the coordinator and is dropped there
    /// instead of waiting in the channel. Returns after `Shutdown` (or when
    /// every sender is gone) once in-flight runs have finished.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncOutcome> + Send + 'static,
    {
        let Some(mut trigger_rx) = self.trigger_rx.take() else {
            warn!("Sync scheduler handle already ran");
            return;
        };
        let mut periodic_interval = self.create_periodic_interval().await;
        let mut runs: JoinSet<(SyncTrigger, SyncOutcome)> = JoinSet::new();

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                trigger = trigger_rx.recv() => {
                    match trigger {
                        None | Some(SyncTrigger::Shutdown) => {
                            info!("Sync scheduler shutting down");
                            break;
                        }
                        Some(trigger) => {
                            debug!("Processing trigger: {:?}", trigger);
                            let run = sync_fn(trigger);
                            runs.spawn(async move { (trigger, run.await) });
                        }
                    }
                }

                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    Self::log_outcome(joined);
                }

                _ = Self::wait_for_periodic(&mut periodic_interval) => {
                    debug!("Triggering periodic sync");
                    let run = sync_fn(SyncTrigger::Periodic);
                    runs.spawn(async move { (SyncTrigger::Periodic, run.await) });
                }
            }

            // Recreate interval if mode changed
            let current_interval = periodic_interval.as_ref().map(|i| i.period());
            let expected_interval = self.get_interval_duration().await;
            if current_interval != expected_interval {
                periodic_interval = self.create_periodic_interval().await;
            }
        }

        while let Some(joined) = runs.join_next().await {
            Self::log_outcome(joined);
        }
        info!("Sync scheduler stopped");
    }

    fn log_outcome(joined: std::result::Result<(SyncTrigger, SyncOutcome), tokio::task::JoinError>) {
        match joined {
            Ok((trigger, SyncOutcome::Completed(report))) => {
                debug!("{:?} sync completed in {:?}", trigger, report.duration)
            }
            Ok((trigger, SyncOutcome::Skipped(reason))) => {
                debug!("{:?} sync skipped: {}", trigger, reason)
            }
            Ok((trigger, SyncOutcome::Failed { phase, message })) => {
                error!("{:?} sync failed during {}: {}", trigger, phase, message)
            }
            Err(e) => error!("Sync task failed: {}", e),
        }
    }

    async fn create_periodic_interval(&self) -> Option<tokio::time::Interval> {
        self.get_interval_duration().await.map(interval)
    }

    async fn get_interval_duration(&self) -> Option<Duration> {
        match &*self.mode.read().await {
            SyncMode::Periodic { interval } if !interval.is_zero() => Some(*interval),
            _ => None,
        }
    }

    async fn wait_for_periodic(interval: &mut Option<tokio::time::Interval>) {
        if let Some(ref mut interval) = interval {
            interval.tick().await;
        } else {
            // Woken up by the loop when the mode changes.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}
