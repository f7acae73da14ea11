//! # ledger-sync: Offline-First Sync Engine for LedgerDesk
//!
//! This crate keeps a per-user local store coherent with the shared
//! per-tenant authoritative store, across concurrent edits from multiple
//! clients, intermittent connectivity, and strict tenant isolation.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncCoordinator (run_sync entry)                 │  │
//! │  │   singleflight · connectivity trigger · 2-min cooldown           │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ UpstreamDriver │  │DownstreamDriver│  │  RealtimeHandler       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Drains outbox  │  │ Pulls delta,   │  │ Applies peer events,   │    │
//! │  │ in dep order,  │  │ resolves, and  │  │ suppressing echoes and │    │
//! │  │ idempotency +  │  │ applies in     │  │ locked entities        │    │
//! │  │ version headers│  │ yielding chunks│  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │         │                     │                     │                   │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  RemoteApi     │  │  LockManager   │  │  ChannelClient (WS)    │    │
//! │  │  (HTTP)        │  │  short-TTL     │  │  auto-reconnect        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`engine`] - Top-level builder and lifecycle ([`SyncEngine`])
//! - [`coordinator`] - `run_sync` entry point, singleflight, cooldown
//! - [`upstream`] - Outbox drain (push driver)
//! - [`downstream`] - Delta pull and chunked apply (pull driver)
//! - [`realtime`] - Peer event handler
//! - [`locks`] - Cooperative record lock manager
//! - [`channel`] - Realtime WebSocket client
//! - [`remote`] - Remote API trait and HTTP implementation
//! - [`connection`] - Online/offline monitor
//! - [`audit`] - Conflict audit logger
//! - [`events`] - Status surface and UI event emitter
//! - [`config`] - Engine configuration
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ledger_db::{Database, DbConfig};
//! use ledger_sync::{SyncConfig, SyncEngineBuilder};
//!
//! let db = Database::new(DbConfig::new("local.db")).await?;
//! let config = SyncConfig::load_or_default(None);
//!
//! let engine = SyncEngineBuilder::new(config, db).build().await?;
//! engine.monitor().set_online(true); // host reports connectivity
//!
//! let report = engine.run_sync().await;
//! println!("pushed {} applied {}", report.upstream.pushed, report.downstream.applied);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod audit;
pub mod channel;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod downstream;
pub mod engine;
pub mod error;
pub mod events;
pub mod locks;
pub mod realtime;
pub mod remote;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testutil;

// =============================================================================
// Re-exports
// =============================================================================

pub use audit::ConflictLogger;
pub use channel::{ChannelClient, ChannelConfig, ChannelHandle, ChannelState, PeerEvent};
pub use config::SyncConfig;
pub use connection::ConnectionMonitor;
pub use coordinator::{CoordinatorHandle, SyncCoordinator};
pub use downstream::DownstreamDriver;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{SyncError, SyncResult};
pub use events::{ChunkApplied, NoOpEmitter, SyncEventEmitter, SyncStatus};
pub use locks::{LockManager, SweeperHandle};
pub use realtime::{NoOpDispatcher, RealtimeHandler, RemoteOp, ViewDispatcher};
pub use remote::{DeltaBatch, HttpRemoteApi, PushOutcome, RemoteApi};
pub use upstream::UpstreamDriver;
