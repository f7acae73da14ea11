//! # ledger-db: Local Store Layer for LedgerDesk Sync
//!
//! This crate provides local database access for the sync engine.
//! It uses SQLite for per-user storage with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       LedgerDesk Data Flow                              │
//! │                                                                         │
//! │  Sync driver (upstream / downstream / realtime)                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     ledger-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │    Schema    │  │   │
//! │  │   │   (pool.rs)   │    │  outbox.rs    │    │  (embedded)  │  │   │
//! │  │   │               │    │  metadata.rs  │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│  conflict.rs  │    │ CREATE TABLE │  │   │
//! │  │   │ capture flag  │    │  lock.rs      │    │ IF NOT EXISTS│  │   │
//! │  │   │               │    │  entity.rs    │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database (per-user local store, WAL mode)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation, capture flag, repository access
//! - [`schema`] - Embedded schema bootstrap
//! - [`error`] - Store error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ledger_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/local.db")).await?;
//! db.entities().ensure_tables(ledger_core::deps::DEPENDENCY_ORDER).await?;
//!
//! let pending = db.outbox().get_pending("tenant-1").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod pool;
pub mod repository;
pub mod schema;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{CaptureGuard, Database, DbConfig};

// Repository re-exports for convenience
pub use repository::conflict::ConflictRepository;
pub use repository::entity::EntityRepository;
pub use repository::lock::LockRepository;
pub use repository::metadata::MetadataRepository;
pub use repository::outbox::OutboxRepository;
