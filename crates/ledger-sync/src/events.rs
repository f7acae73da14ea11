//! # Sync Events
//!
//! Status surface and event emitter for UI integration. The engine never
//! depends on a UI; a host implements [`SyncEventEmitter`] and receives
//! progress, per-chunk refresh payloads, and completion signals.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// =============================================================================
// Sync Status
// =============================================================================

/// Current engine status for external queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Whether the connection monitor reports online.
    pub is_online: bool,

    /// Whether a `run_sync` is currently executing.
    pub is_running: bool,

    /// Number of drainable outbox items for the active tenant.
    pub pending_count: i64,

    /// Last successful sync timestamp (ISO-8601), if any.
    pub last_sync: Option<String>,

    /// Last error message, if any.
    pub last_error: Option<String>,
}

// =============================================================================
// Chunk Payload
// =============================================================================

/// Rows applied by one downstream chunk, grouped by entity type, so UIs
/// can refresh incrementally instead of waiting for the full pull.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkApplied {
    pub entities: BTreeMap<String, Vec<Value>>,
}

impl ChunkApplied {
    /// Groups a chunk's writes by entity type.
    pub fn from_writes(writes: &[(String, Value)]) -> Self {
        let mut entities: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (entity_type, row) in writes {
            entities.entry(entity_type.clone()).or_default().push(row.clone());
        }
        ChunkApplied { entities }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Trait for emitting sync events (implemented by the host shell).
pub trait SyncEventEmitter: Send + Sync {
    /// Emits a status change.
    fn emit_status(&self, status: &SyncStatus);

    /// Emits downstream apply progress: `applied_so_far` of `total` rows.
    fn emit_progress(&self, applied_so_far: u64, total: u64);

    /// Emits the rows a downstream chunk just applied.
    fn emit_chunk_applied(&self, chunk: &ChunkApplied);

    /// Emitted once per downstream drive that applied at least one row.
    fn emit_downstream_complete(&self, applied: u64);

    /// Emits a sync error.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter for headless use and tests.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_progress(&self, _applied_so_far: u64, _total: u64) {}
    fn emit_chunk_applied(&self, _chunk: &ChunkApplied) {}
    fn emit_downstream_complete(&self, _applied: u64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}
