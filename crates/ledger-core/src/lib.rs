//! # ledger-core: Pure Domain Logic for LedgerDesk Sync
//!
//! This crate is the **heart** of the sync engine. It contains the pieces
//! that must be deterministic and testable without any I/O: the conflict
//! resolver, the entity dependency ranking, the domain types shared by the
//! local store and the drivers, and ID/timestamp generation.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      LedgerDesk Sync Architecture                       │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    ledger-sync (Engine)                         │   │
//! │  │    upstream driver ── downstream driver ── realtime handler     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ ledger-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ resolver  │  │   deps    │  │    ids    │  │   │
//! │  │   │ OutboxItem│  │ LWW/merge │  │ rank table│  │ uuid/clock│  │   │
//! │  │   │ RecordLock│  │ versioned │  │ stable ord│  │ ISO-8601  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    ledger-db (Local Store)                      │   │
//! │  │        SQLite: outbox, metadata, conflicts, locks, entities     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (OutboxItem, RecordLock, ConflictLogEntry, etc.)
//! - [`resolver`] - The three-tier conflict resolver (pure function)
//! - [`deps`] - Entity dependency ranking for FK-safe ordering
//! - [`ids`] - Idempotency keys and monotonic-ish ISO-8601 timestamps
//!
//! Every function in this crate is total: malformed rows degrade to a
//! safe default (missing timestamps compare as the epoch, unknown entity
//! types rank last) instead of failing.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod deps;
pub mod ids;
pub mod resolver;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use ids::{new_id, now, now_iso, to_iso};
pub use resolver::{resolve, ChosenRecord, Decision, EntityClass, ResolutionContext};
pub use types::*;

pub use ids::EPOCH_ISO;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Synthetic entity type used for tenant-wide sync metadata rows.
pub const GLOBAL_ENTITY_TYPE: &str = "_global";

/// Reserved ID prefix for system-seeded records that must never be pushed.
pub const SYSTEM_ID_PREFIX: &str = "sys-";

/// Maximum length stored for an outbox error message.
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;
