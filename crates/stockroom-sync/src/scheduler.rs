//! # Sync Scheduler
//!
//! Background loop that runs [`SyncEngine::sync_all`] on an interval, on
//! demand, and purges old synced journal entries.
//!
//! ## Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncScheduler::run                              │
//! │                                                                         │
//! │   tokio::select! {                                                      │
//! │       interval.tick()   ──► sync_all() ──► emitter                      │
//! │       trigger_rx.recv() ──► sync_all() ──► emitter                      │
//! │       cleanup.tick()    ──► journal.cleanup_synced(days)                │
//! │       shutdown_rx.recv()──► break                                       │
//! │   }                                                                     │
//! │                                                                         │
//! │   The interval follows `sync_interval_minutes` and is rebuilt when     │
//! │   the stored value changes.                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use stockroom_core::{SyncHealth, SyncReport};

use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};

/// Journal cleanup runs this often.
const CLEANUP_PERIOD: Duration = Duration::from_secs(6 * 60 * 60);

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives the outcome of scheduled runs (UI bridge, tray icon, ...).
pub trait SyncEventEmitter: Send + Sync {
    /// A run finished.
    fn emit_report(&self, report: &SyncReport);

    /// Health after a run.
    fn emit_health(&self, health: &SyncHealth);

    /// A run aborted.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// Emitter that drops every event.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_report(&self, _report: &SyncReport) {}
    fn emit_health(&self, _health: &SyncHealth) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Scheduler
// =============================================================================

pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    emitter: Arc<dyn SyncEventEmitter>,
    cleanup_after_days: u32,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self::with_emitter(engine, Arc::new(NoOpEmitter))
    }

    pub fn with_emitter(engine: Arc<SyncEngine>, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        SyncScheduler {
            engine,
            emitter,
            cleanup_after_days: 7,
        }
    }

    /// Synced journal entries older than `days` are purged.
    pub fn cleanup_after_days(mut self, days: u32) -> Self {
        self.cleanup_after_days = days;
        self
    }

    /// Starts the loop on the current runtime.
    ///
    /// The first tick fires immediately, so a run starts right away.
    pub async fn spawn(self) -> SyncResult<SchedulerHandle> {
        let minutes = self.interval_minutes().await?;
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        info!(interval_minutes = minutes, "Sync scheduler starting");
        let task = tokio::spawn(self.run(minutes, trigger_rx, shutdown_rx));

        Ok(SchedulerHandle {
            trigger_tx,
            shutdown_tx,
            task,
        })
    }

    async fn interval_minutes(&self) -> SyncResult<i64> {
        let metadata = self.engine.database().metadata().get().await?;
        Ok(metadata.sync_interval_minutes.max(1))
    }

    async fn run(
        self,
        mut minutes: i64,
        mut trigger_rx: mpsc::Receiver<()>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut interval = build_interval(minutes);
        let mut cleanup = tokio::time::interval(CLEANUP_PERIOD);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once("interval").await;
                }

                Some(()) = trigger_rx.recv() => {
                    self.run_once("manual").await;
                }

                _ = cleanup.tick() => {
                    self.cleanup().await;
                }

                _ = shutdown_rx.recv() => {
                    info!("Sync scheduler received shutdown");
                    break;
                }
            }

            match self.interval_minutes().await {
                Ok(current) if current != minutes => {
                    info!(from = minutes, to = current, "Sync interval changed");
                    minutes = current;
                    interval = build_interval(minutes);
                    // skip the immediate first tick of the new interval
                    interval.reset();
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Could not read sync interval"),
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn run_once(&self, reason: &str) {
        debug!(reason, "Scheduled sync starting");
        match self.engine.sync_all().await {
            Ok(report) => {
                self.emitter.emit_report(&report);
                match self.engine.health().await {
                    Ok(health) => self.emitter.emit_health(&health),
                    Err(e) => warn!(error = %e, "Could not compute sync health"),
                }
            }
            Err(SyncError::SyncDisabled) => debug!("Sync disabled, run skipped"),
            Err(SyncError::AlreadyInProgress) => debug!("Sync already running, run skipped"),
            Err(e) => {
                error!(error = %e, reason, "Scheduled sync failed");
                self.emitter.emit_error(&e.to_string(), e.is_retryable());
            }
        }
    }

    async fn cleanup(&self) {
        match self
            .engine
            .database()
            .journal()
            .cleanup_synced(self.cleanup_after_days)
            .await
        {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Old synced journal entries purged"),
            Err(e) => warn!(error = %e, "Journal cleanup failed"),
        }
    }
}

fn build_interval(minutes: i64) -> Interval {
    let secs = u64::try_from(minutes).unwrap_or(1).max(1) * 60;
    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

// =============================================================================
// Handle
// =============================================================================

/// Controls a spawned scheduler.
pub struct SchedulerHandle {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Requests a run now. A request already waiting absorbs this one.
    pub fn trigger(&self) -> SyncResult<()> {
        match self.trigger_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(SyncError::ShuttingDown),
        }
    }

    /// Stops the loop and waits for the in-flight run, if any.
    pub async fn shutdown(self) -> SyncResult<()> {
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| SyncError::ChannelError(format!("scheduler task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::fake::FakeBackend;
    use serde_json::json;
    use std::sync::Mutex;
    use stockroom_core::EntityKind;
    use stockroom_db::{Database, DbConfig};

    #[derive(Default)]
    struct RecordingEmitter {
        reports: Mutex<Vec<SyncReport>>,
        errors: Mutex<Vec<String>>,
    }

    impl RecordingEmitter {
        fn report_count(&self) -> usize {
            self.reports.lock().unwrap().len()
        }
    }

    impl SyncEventEmitter for RecordingEmitter {
        fn emit_report(&self, report: &SyncReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
        fn emit_health(&self, _health: &SyncHealth) {}
        fn emit_error(&self, message: &str, _retryable: bool) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    async fn engine(enabled: bool) -> (Arc<SyncEngine>, Arc<FakeBackend>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.metadata().set_enabled(enabled).await.unwrap();
        let fake = Arc::new(FakeBackend::new());
        let settings = EngineSettings {
            item_delay: Duration::ZERO,
            ..Default::default()
        };
        (Arc::new(SyncEngine::new(db, fake.clone(), settings)), fake)
    }

    async fn wait_for_reports(emitter: &RecordingEmitter, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while emitter.report_count() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_runs_at_start_and_on_trigger() {
        let (engine, fake) = engine(true).await;
        let emitter = Arc::new(RecordingEmitter::default());
        let handle = SyncScheduler::with_emitter(engine.clone(), emitter.clone())
            .spawn()
            .await
            .unwrap();

        wait_for_reports(&emitter, 1).await;

        engine
            .database()
            .entities()
            .create(
                EntityKind::Customer,
                json!({"id": "C1", "name": "Bo"}).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();
        handle.trigger().unwrap();
        wait_for_reports(&emitter, 2).await;

        assert_eq!(fake.rows(EntityKind::Customer).len(), 1);
        assert!(emitter.errors.lock().unwrap().is_empty());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_sync_emits_nothing() {
        let (engine, _fake) = engine(false).await;
        let emitter = Arc::new(RecordingEmitter::default());
        let handle = SyncScheduler::with_emitter(engine, emitter.clone())
            .spawn()
            .await
            .unwrap();

        handle.trigger().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(emitter.report_count(), 0);
        assert!(emitter.errors.lock().unwrap().is_empty());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_after_shutdown_is_rejected() {
        let (engine, _fake) = engine(false).await;
        let handle = SyncScheduler::new(engine).spawn().await.unwrap();
        let trigger_tx = handle.trigger_tx.clone();
        handle.shutdown().await.unwrap();

        let closed = SchedulerHandle {
            trigger_tx,
            shutdown_tx: mpsc::channel(1).0,
            task: tokio::spawn(async {}),
        };
        assert!(matches!(closed.trigger(), Err(SyncError::ShuttingDown)));
    }
}
