//! # Domain Types
//!
//! Core types shared by the local store and the sync drivers.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Domain Types                               │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌──────────────────┐   ┌────────────────────┐   │
//! │  │   OutboxItem    │   │ SyncMetadataRow  │   │  ConflictLogEntry  │   │
//! │  │  ─────────────  │   │  ──────────────  │   │  ────────────────  │   │
//! │  │  id = idem. key │   │  last_pull_at    │   │  both snapshots    │   │
//! │  │  action, status │   │  last_synced_at  │   │  both versions     │   │
//! │  │  retry_count    │   │  per (tenant,    │   │  resolution        │   │
//! │  │  payload JSON   │   │      entity)     │   │  append-only       │   │
//! │  └─────────────────┘   └──────────────────┘   └────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌──────────────────┐   ┌────────────────────┐   │
//! │  │   RecordLock    │   │  OutboxStatus    │   │ ConflictResolution │   │
//! │  │  ─────────────  │   │  ──────────────  │   │  ────────────────  │   │
//! │  │  (type, id)     │   │  Pending         │   │  LocalWins         │   │
//! │  │  holder, TTL    │   │  Syncing         │   │  RemoteWins        │   │
//! │  │  expires_at     │   │  Synced/Failed   │   │  Merged/Review     │   │
//! │  └─────────────────┘   └──────────────────┘   └────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity Invariants
//! - `id` is immutable; records are keyed by `id` across all stores.
//! - `tenant_id` never changes after creation (rental agreements carry the
//!   same key under the legacy name `org_id`).
//! - `version` increases by exactly 1 per accepted authoritative write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::parse_iso;

// =============================================================================
// Sync Action
// =============================================================================

/// The local mutation an outbox item transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncAction::Create => write!(f, "create"),
            SyncAction::Update => write!(f, "update"),
            SyncAction::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for SyncAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncAction::Create),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            other => Err(format!("unknown sync action: '{other}'")),
        }
    }
}

// =============================================================================
// Outbox Status
// =============================================================================

/// Lifecycle state of an outbox item.
///
/// Legal transitions: `pending → syncing → {synced, failed}` and
/// `failed → syncing`. Nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl OutboxStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: OutboxStatus) -> bool {
        use OutboxStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing) | (Syncing, Synced) | (Syncing, Failed) | (Failed, Syncing)
        )
    }

    /// True for items the upstream driver should pick up.
    pub fn is_drainable(self) -> bool {
        matches!(self, OutboxStatus::Pending | OutboxStatus::Failed)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboxStatus::Pending => write!(f, "pending"),
            OutboxStatus::Syncing => write!(f, "syncing"),
            OutboxStatus::Synced => write!(f, "synced"),
            OutboxStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "syncing" => Ok(OutboxStatus::Syncing),
            "synced" => Ok(OutboxStatus::Synced),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(format!("unknown outbox status: '{other}'")),
        }
    }
}

// =============================================================================
// Outbox Item
// =============================================================================

/// A durable pending write, queued per tenant.
///
/// The row `id` doubles as the idempotency key transmitted to the server;
/// it never changes after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    /// Unique ID; also the `Idempotency-Key` header value.
    pub id: String,

    /// Tenant this write belongs to.
    pub tenant_id: String,

    /// User who made the mutation, when known.
    pub user_id: Option<String>,

    /// Entity type in snake_case ("transactions", "rental_agreements", ...).
    pub entity_type: String,

    /// The mutation kind.
    pub action: SyncAction,

    /// ID of the entity being written.
    pub entity_id: String,

    /// Full entity snapshot as JSON; `None` for deletes.
    pub payload: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// When the item reached `synced`.
    pub synced_at: Option<DateTime<Utc>>,

    /// Current lifecycle state.
    pub status: OutboxStatus,

    /// Number of failed push attempts so far.
    pub retry_count: i64,

    /// Last failure, truncated to 500 chars.
    pub error_message: Option<String>,
}

// =============================================================================
// Sync Metadata
// =============================================================================

/// Watermark row, one per `(tenant_id, entity_type)`.
///
/// The synthetic entity type `_global` carries the tenant-wide cursors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadataRow {
    pub tenant_id: String,
    pub entity_type: String,

    /// Upstream watermark: when we last pushed successfully.
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Downstream watermark: the cursor for incremental pulls.
    /// Monotonic non-decreasing.
    pub last_pull_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Conflict Log
// =============================================================================

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    LocalWins,
    RemoteWins,
    Merged,
    PendingReview,
    /// The server rejected our optimistic version; its state is canonical.
    ServerWins,
}

impl std::fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictResolution::LocalWins => write!(f, "local_wins"),
            ConflictResolution::RemoteWins => write!(f, "remote_wins"),
            ConflictResolution::Merged => write!(f, "merged"),
            ConflictResolution::PendingReview => write!(f, "pending_review"),
            ConflictResolution::ServerWins => write!(f, "server_wins"),
        }
    }
}

impl std::str::FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_wins" => Ok(ConflictResolution::LocalWins),
            "remote_wins" => Ok(ConflictResolution::RemoteWins),
            "merged" => Ok(ConflictResolution::Merged),
            "pending_review" => Ok(ConflictResolution::PendingReview),
            "server_wins" => Ok(ConflictResolution::ServerWins),
            other => Err(format!("unknown conflict resolution: '{other}'")),
        }
    }
}

/// One audit row per resolver decision. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictLogEntry {
    pub id: String,
    pub tenant_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub local_version: Option<i64>,
    pub remote_version: Option<i64>,
    pub local_data: Option<Value>,
    pub remote_data: Option<Value>,
    pub resolution: ConflictResolution,
    /// User ID that resolved it, or `"auto"` for engine decisions.
    pub resolved_by: String,
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Record Lock
// =============================================================================

/// Short-TTL cooperative lock: "user U is editing entity E".
///
/// Advisory, not mandatory. Expired locks are transparently dropped on
/// read; only the holder may release or extend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordLock {
    pub entity_type: String,
    pub entity_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub tenant_id: Option<String>,
    pub locked_at: DateTime<Utc>,
    /// Always `locked_at + TTL`; extension by the holder resets it.
    pub expires_at: DateTime<Utc>,
}

impl RecordLock {
    /// Storage key: `"<entity_type>:<entity_id>"`.
    pub fn key(&self) -> String {
        lock_key(&self.entity_type, &self.entity_id)
    }

    /// Whether the lock has lapsed at instant `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether `user_id` holds this lock and it is still valid.
    pub fn is_held_by(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        !self.is_expired_at(now) && self.user_id == user_id
    }
}

/// Builds the composite lock key for `(entity_type, entity_id)`.
pub fn lock_key(entity_type: &str, entity_id: &str) -> String {
    format!("{entity_type}:{entity_id}")
}

// =============================================================================
// Sync Reports
// =============================================================================

/// Counters from one upstream (push) drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamReport {
    pub pushed: u64,
    pub failed: u64,
}

/// Counters from one downstream (pull/apply) drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamReport {
    pub applied: u64,
    pub skipped: u64,
    pub conflicts: u64,
}

/// Aggregate result of one `run_sync`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub upstream: UpstreamReport,
    pub downstream: DownstreamReport,
    /// True when no outbox item failed to push.
    pub success: bool,
}

impl SyncReport {
    /// The no-op result returned when sync is offline or already running.
    pub fn zero() -> Self {
        SyncReport {
            success: true,
            ..Default::default()
        }
    }
}

// =============================================================================
// Row Field Extraction
// =============================================================================
// Entity rows cross the engine as schemaless JSON objects; these helpers
// pull out the bookkeeping fields every record carries.

/// Reads the immutable record ID.
pub fn row_id(row: &Value) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

/// Reads the tenant key, accepting the legacy `org_id` spelling used by
/// rental agreements. `tenant_id` wins when both are present.
pub fn row_tenant(row: &Value) -> Option<&str> {
    row.get("tenant_id")
        .and_then(Value::as_str)
        .or_else(|| row.get("org_id").and_then(Value::as_str))
}

/// True when a row carries both `tenant_id` and `org_id` with different
/// values. Callers surface a warning and trust `tenant_id`.
pub fn tenant_keys_diverge(row: &Value) -> bool {
    match (
        row.get("tenant_id").and_then(Value::as_str),
        row.get("org_id").and_then(Value::as_str),
    ) {
        (Some(t), Some(o)) => t != o,
        _ => false,
    }
}

/// Reads the optimistic concurrency version, if present and integral.
pub fn row_version(row: &Value) -> Option<i64> {
    row.get("version").and_then(Value::as_i64)
}

/// Reads and parses `updated_at` (or the camelCase spelling).
pub fn row_updated_at(row: &Value) -> Option<DateTime<Utc>> {
    row.get("updated_at")
        .or_else(|| row.get("updatedAt"))
        .and_then(Value::as_str)
        .and_then(parse_iso)
}
