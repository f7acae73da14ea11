//! # Sync Coordinator
//!
//! The single public entry point of the engine: `run_sync(tenant)` wires
//! the upstream drive, then the downstream drive, under singleflight and
//! a connectivity-trigger cooldown.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Coordinator State Machine                         │
//! │                                                                         │
//! │                 ┌────────┐   run_sync()   ┌─────────┐                  │
//! │                 │  idle  │ ─────────────► │ running │                  │
//! │                 └────────┘                └────┬────┘                  │
//! │                      ▲        drives done      │                       │
//! │                      └─────────────────────────┘                       │
//! │                                                                         │
//! │  SINGLEFLIGHT: a second run_sync observing running=true returns a      │
//! │  zero result immediately. At most one run_sync body per process.       │
//! │                                                                         │
//! │  TRIGGER: offline→online transition, at most once per cooldown         │
//! │  window (default 2 min), runs run_sync asynchronously.                 │
//! │                                                                         │
//! │  run_sync(T):                                                          │
//! │    offline or already running  → zero result                           │
//! │    upstream = push drive       → counters (pushed, failed)             │
//! │    downstream = pull drive     → counters (applied, skipped, conflicts)│
//! │    success = upstream.failed == 0                                      │
//! │    cleanup: drop synced outbox items past retention                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionMonitor;
use crate::downstream::DownstreamDriver;
use crate::events::{SyncEventEmitter, SyncStatus};
use crate::upstream::UpstreamDriver;
use ledger_core::ids::to_iso;
use ledger_core::SyncReport;
use ledger_db::Database;

// =============================================================================
// Coordinator
// =============================================================================

/// Orchestrates one sync cycle and its lifecycle triggers.
pub struct SyncCoordinator {
    db: Database,
    upstream: UpstreamDriver,
    downstream: DownstreamDriver,
    monitor: ConnectionMonitor,
    emitter: Arc<dyn SyncEventEmitter>,

    /// Singleflight flag: at most one run_sync body at a time.
    running: AtomicBool,

    /// When the last connectivity-triggered sync started.
    last_triggered: Mutex<Option<Instant>>,

    /// Minimum gap between connectivity-triggered syncs.
    cooldown: Duration,

    /// Synced outbox items older than this are dropped after a cycle.
    retention_days: u32,
}

impl SyncCoordinator {
    /// Creates a coordinator.
    pub fn new(
        db: Database,
        upstream: UpstreamDriver,
        downstream: DownstreamDriver,
        monitor: ConnectionMonitor,
        emitter: Arc<dyn SyncEventEmitter>,
        cooldown: Duration,
        retention_days: u32,
    ) -> Self {
        SyncCoordinator {
            db,
            upstream,
            downstream,
            monitor,
            emitter,
            running: AtomicBool::new(false),
            last_triggered: Mutex::new(None),
            cooldown,
            retention_days,
        }
    }

    /// Whether a sync cycle is executing right now.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one push-then-pull cycle for the tenant.
    ///
    /// Offline, or with a cycle already in flight, this is a no-op
    /// returning zero counters.
    pub async fn run_sync(&self, tenant_id: &str) -> SyncReport {
        if !self.monitor.is_online() {
            debug!(tenant_id = %tenant_id, "Offline, skipping sync");
            return SyncReport::zero();
        }

        // Singleflight: only the caller that flips the flag proceeds.
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(tenant_id = %tenant_id, "Sync already running, skipping");
            return SyncReport::zero();
        }
        let _guard = RunningGuard { flag: &self.running };

        info!(tenant_id = %tenant_id, "Sync cycle starting");
        let mut report = SyncReport::default();
        let mut last_error = None;

        match self.upstream.run(tenant_id).await {
            Ok(upstream) => report.upstream = upstream,
            Err(e) => {
                error!(?e, "Upstream drive failed");
                self.emitter.emit_error(&e.to_string(), e.is_retryable());
                last_error = Some(e.to_string());
                report.upstream.failed += 1;
            }
        }

        match self.downstream.run(tenant_id).await {
            Ok(downstream) => report.downstream = downstream,
            Err(e) => {
                error!(?e, "Downstream drive failed");
                self.emitter.emit_error(&e.to_string(), e.is_retryable());
                last_error = Some(e.to_string());
            }
        }

        report.success = report.upstream.failed == 0;

        // Outbox hygiene; never fails a cycle.
        if let Err(e) = self
            .db
            .outbox()
            .clear_synced_older_than(tenant_id, self.retention_days)
            .await
        {
            warn!(?e, "Outbox cleanup failed");
        }

        let status = self.build_status(tenant_id, last_error).await;
        self.emitter.emit_status(&status);

        info!(
            tenant_id = %tenant_id,
            pushed = report.upstream.pushed,
            failed = report.upstream.failed,
            applied = report.downstream.applied,
            skipped = report.downstream.skipped,
            conflicts = report.downstream.conflicts,
            success = report.success,
            "Sync cycle complete"
        );
        report
    }

    /// Current engine status for UI queries.
    pub async fn status(&self, tenant_id: &str) -> SyncStatus {
        self.build_status(tenant_id, None).await
    }

    async fn build_status(&self, tenant_id: &str, last_error: Option<String>) -> SyncStatus {
        let pending_count = self
            .db
            .outbox()
            .pending_count(tenant_id)
            .await
            .unwrap_or_default();
        let last_sync = self
            .db
            .metadata()
            .get_last_synced_at(tenant_id, ledger_core::GLOBAL_ENTITY_TYPE)
            .await
            .ok()
            .flatten()
            .map(to_iso);

        SyncStatus {
            is_online: self.monitor.is_online(),
            is_running: self.is_running(),
            pending_count,
            last_sync,
            last_error,
        }
    }

    /// Starts the connectivity trigger: on every offline→online
    /// transition outside the cooldown window, a sync cycle is spawned.
    pub fn start(self: &Arc<Self>, tenant_id: impl Into<String>) -> CoordinatorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let coordinator = Arc::clone(self);
        let tenant_id = tenant_id.into();
        let mut transitions = coordinator.monitor.subscribe();

        tokio::spawn(async move {
            info!("Connectivity trigger started");

            loop {
                tokio::select! {
                    changed = transitions.changed() => {
                        if changed.is_err() {
                            break; // monitor dropped
                        }
                        let online = *transitions.borrow_and_update();
                        if !online {
                            continue;
                        }

                        if coordinator.is_running() {
                            debug!("Online again but sync already running");
                            continue;
                        }
                        if !coordinator.note_triggered() {
                            debug!("Online again but within cooldown window");
                            continue;
                        }

                        let coordinator = Arc::clone(&coordinator);
                        let tenant_id = tenant_id.clone();
                        tokio::spawn(async move {
                            coordinator.run_sync(&tenant_id).await;
                        });
                    }

                    _ = shutdown_rx.recv() => {
                        info!("Connectivity trigger shutting down");
                        break;
                    }
                }
            }
        });

        CoordinatorHandle { shutdown_tx }
    }

    /// Records a trigger attempt; false when still inside the cooldown.
    fn note_triggered(&self) -> bool {
        let mut last = self
            .last_triggered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.cooldown => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Clears the singleflight flag on every exit path.
struct RunningGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Coordinator Handle
// =============================================================================

/// Handle for stopping the connectivity trigger task.
pub struct CoordinatorHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl CoordinatorHandle {
    /// Unsubscribes from connectivity transitions.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
