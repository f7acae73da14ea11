//! # Sync Engine
//!
//! Top-level wiring: builds and starts every component from a
//! [`SyncConfig`] and a [`Database`], and owns their lifecycles.
//!
//! ## Engine Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncEngine Wiring                               │
//! │                                                                         │
//! │  SyncEngineBuilder::new(config, db)                                    │
//! │      .with_dispatcher(view model sink)                                 │
//! │      .with_emitter(UI events)                                          │
//! │      .build().await                                                    │
//! │       │                                                                 │
//! │       ├── RemoteApi (HTTP)      push / pull / lock replication         │
//! │       ├── ChannelClient (WS)    spawned when realtime.url is set       │
//! │       ├── LockManager           reloaded from store, sweeper spawned   │
//! │       ├── RealtimeHandler       spawned over the channel's events      │
//! │       ├── Upstream/Downstream   drivers behind the coordinator         │
//! │       └── SyncCoordinator       connectivity trigger started           │
//! │                                                                         │
//! │  engine.run_sync().await        manual cycle                           │
//! │  engine.monitor()               feed online/offline transitions        │
//! │  engine.shutdown().await        stop every spawned task                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use tracing::info;

use crate::audit::ConflictLogger;
use crate::channel::{ChannelClient, ChannelConfig, ChannelHandle};
use crate::config::SyncConfig;
use crate::connection::ConnectionMonitor;
use crate::coordinator::{CoordinatorHandle, SyncCoordinator};
use crate::downstream::DownstreamDriver;
use crate::error::{SyncError, SyncResult};
use crate::events::{NoOpEmitter, SyncEventEmitter, SyncStatus};
use crate::locks::{LockManager, SweeperHandle};
use crate::realtime::{NoOpDispatcher, RealtimeHandler, RealtimeHandlerHandle, ViewDispatcher};
use crate::remote::{HttpRemoteApi, RemoteApi};
use crate::upstream::UpstreamDriver;
use ledger_core::SyncReport;
use ledger_db::Database;

// =============================================================================
// Builder
// =============================================================================

/// Builder for a wired, running [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: SyncConfig,
    db: Database,
    remote: Option<Arc<dyn RemoteApi>>,
    dispatcher: Arc<dyn ViewDispatcher>,
    emitter: Arc<dyn SyncEventEmitter>,
}

impl SyncEngineBuilder {
    /// Starts a builder over a config and an opened local store.
    pub fn new(config: SyncConfig, db: Database) -> Self {
        SyncEngineBuilder {
            config,
            db,
            remote: None,
            dispatcher: Arc::new(NoOpDispatcher),
            emitter: Arc::new(NoOpEmitter),
        }
    }

    /// Overrides the remote API client (tests use a fake).
    pub fn with_remote(mut self, remote: Arc<dyn RemoteApi>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the view model dispatcher for realtime events.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn ViewDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Sets the UI event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Validates the config, wires every component, and spawns the
    /// background tasks.
    pub async fn build(self) -> SyncResult<SyncEngine> {
        self.config.validate()?;
        if self.config.tenant_id().is_empty() {
            return Err(SyncError::InvalidConfig(
                "session.tenant_id must be set".into(),
            ));
        }

        let config = self.config;
        let db = self.db;

        let remote: Arc<dyn RemoteApi> = match self.remote {
            Some(remote) => remote,
            None => Arc::new(HttpRemoteApi::new(&config.api)?),
        };

        // Realtime channel is optional; without it locks stay local-only
        // and no peer events arrive.
        let mut channel_handle: Option<ChannelHandle> = None;
        let mut channel_rx = None;
        if !config.realtime.url.is_empty() {
            let channel_config =
                ChannelConfig::from_settings(&config.realtime, config.tenant_id());
            let (handle, rx) = ChannelClient::spawn(channel_config);
            channel_handle = Some(handle);
            channel_rx = Some(rx);
        }

        let locks = Arc::new(LockManager::new(
            db.locks(),
            remote.clone(),
            channel_handle.clone(),
            config.lock_ttl(),
        ));
        locks.load().await?;
        let sweeper = locks.spawn_sweeper(std::time::Duration::from_secs(
            config.engine.lock_sweep_secs,
        ));

        let realtime_handle = channel_rx.map(|rx| {
            let (handler, handle) = RealtimeHandler::new(
                db.clone(),
                locks.clone(),
                self.dispatcher,
                config.user_id(),
                rx,
            );
            tokio::spawn(handler.run());
            handle
        });

        let logger = ConflictLogger::new(db.conflicts(), config.device_id());
        let monitor = ConnectionMonitor::new(false);

        let upstream = UpstreamDriver::new(
            db.clone(),
            remote.clone(),
            locks.clone(),
            logger.clone(),
            config.user_id(),
        );
        let downstream = DownstreamDriver::new(
            db.clone(),
            remote,
            logger,
            self.emitter.clone(),
            config.engine.chunk_size,
        );

        let coordinator = Arc::new(SyncCoordinator::new(
            db,
            upstream,
            downstream,
            monitor.clone(),
            self.emitter,
            config.cooldown(),
            config.engine.outbox_retention_days,
        ));
        let trigger = coordinator.start(config.tenant_id());

        info!(
            tenant_id = %config.tenant_id(),
            device_id = %config.device_id(),
            realtime = channel_handle.is_some(),
            "Sync engine started"
        );

        Ok(SyncEngine {
            config,
            coordinator,
            locks,
            monitor,
            channel: channel_handle,
            realtime: realtime_handle,
            sweeper,
            trigger,
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

/// A fully wired, running sync engine.
pub struct SyncEngine {
    config: SyncConfig,
    coordinator: Arc<SyncCoordinator>,
    locks: Arc<LockManager>,
    monitor: ConnectionMonitor,
    channel: Option<ChannelHandle>,
    realtime: Option<RealtimeHandlerHandle>,
    sweeper: SweeperHandle,
    trigger: CoordinatorHandle,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine").finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Runs one sync cycle for the configured tenant.
    pub async fn run_sync(&self) -> SyncReport {
        self.coordinator.run_sync(self.config.tenant_id()).await
    }

    /// Current engine status.
    pub async fn status(&self) -> SyncStatus {
        self.coordinator.status(self.config.tenant_id()).await
    }

    /// The connection monitor; the host feeds transitions into it.
    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// The cooperative lock manager.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Stops every background task gracefully.
    pub async fn shutdown(self) {
        info!("Sync engine shutting down");

        self.trigger.stop().await;
        self.sweeper.shutdown().await;
        if let Some(realtime) = &self.realtime {
            realtime.shutdown().await;
        }
        if let Some(channel) = &self.channel {
            let _ = channel.shutdown().await;
        }

        info!("Sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedRemote;
    use ledger_core::SyncAction;
    use ledger_db::DbConfig;
    use serde_json::json;

    fn test_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.session.tenant_id = "T".into();
        config.session.user_id = "u1".into();
        // No realtime URL: engine runs without a channel.
        config
    }

    #[tokio::test]
    async fn test_engine_builds_and_syncs() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(ScriptedRemote::new());

        let engine = SyncEngineBuilder::new(test_config(), db.clone())
            .with_remote(remote.clone())
            .build()
            .await
            .unwrap();

        db.outbox()
            .enqueue("T", Some("u1"), "contacts", SyncAction::Create, "c1",
                Some(&json!({"id": "c1", "tenant_id": "T"})))
            .await
            .unwrap();

        // Offline at first: no-op.
        let report = engine.run_sync().await;
        assert_eq!(report, SyncReport::zero());

        engine.monitor().set_online(true);
        let report = engine.run_sync().await;
        assert!(report.success);
        assert_eq!(report.upstream.pushed, 1);

        let status = engine.status().await;
        assert_eq!(status.pending_count, 0);
        assert!(status.last_sync.is_some());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_requires_tenant() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut config = test_config();
        config.session.tenant_id = String::new();

        let err = SyncEngineBuilder::new(config, db)
            .with_remote(Arc::new(ScriptedRemote::new()))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }
}
