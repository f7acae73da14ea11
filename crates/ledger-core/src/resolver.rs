//! # Conflict Resolver
//!
//! The pure function at the center of the sync engine: given the local and
//! remote versions of an entity, decide which record survives.
//!
//! ## Three Tiers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Resolution Strategy Selection                       │
//! │                                                                         │
//! │  classify(entity_type)                                                 │
//! │       │                                                                 │
//! │       ├── FINANCIAL (transactions, invoices, bills, installment_plans, │
//! │       │              payroll_runs, payslips)                           │
//! │       │        │                                                        │
//! │       │        ▼                                                        │
//! │       │   VERSION-AWARE: |Δversion| > 1 → keep local, flag for review  │
//! │       │                  otherwise fall through to field-merge         │
//! │       │                                                                 │
//! │       ├── REFERENCE (buildings, units, properties, plan_amenities)     │
//! │       │        │                                                        │
//! │       │        ▼                                                        │
//! │       │   LAST-WRITE-WINS: newer updated_at wins, ties go to remote    │
//! │       │                                                                 │
//! │       └── OPERATIONAL (everything else)                                │
//! │                │                                                        │
//! │                ▼                                                        │
//! │           FIELD-MERGE: diff non-bookkeeping fields, newer side's       │
//! │           values win per field; equal timestamps flag for review       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The resolver never performs I/O and never fails: every input pair maps
//! to a [`Decision`]. Callers log the decision to the conflict audit table.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::types::{row_updated_at, row_version, ConflictResolution};

// =============================================================================
// Entity Classification
// =============================================================================

/// Entity types whose records are money-bearing; overwriting them on a
/// stale read is never acceptable.
pub const FINANCIAL_TYPES: &[&str] = &[
    "transactions",
    "invoices",
    "bills",
    "installment_plans",
    "payroll_runs",
    "payslips",
];

/// Mostly-static reference data; cheap to re-edit, so last write wins.
pub const REFERENCE_TYPES: &[&str] = &["buildings", "units", "properties", "plan_amenities"];

/// Sensitivity tier of an entity type; selects the resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
    /// Version-aware resolution.
    Financial,
    /// Last-write-wins.
    Reference,
    /// Field-level merge.
    Operational,
}

/// Classifies an entity type into its resolution tier.
pub fn classify(entity_type: &str) -> EntityClass {
    if FINANCIAL_TYPES.contains(&entity_type) {
        EntityClass::Financial
    } else if REFERENCE_TYPES.contains(&entity_type) {
        EntityClass::Reference
    } else {
        EntityClass::Operational
    }
}

// =============================================================================
// Bookkeeping Fields
// =============================================================================

/// Fields ignored when diffing two records: identity, ownership, and
/// timestamps, in both snake_case and camelCase spellings.
const BOOKKEEPING_FIELDS: &[&str] = &[
    "id",
    "tenant_id",
    "tenantId",
    "org_id",
    "orgId",
    "user_id",
    "userId",
    "version",
    "created_at",
    "createdAt",
    "updated_at",
    "updatedAt",
    "deleted_at",
    "deletedAt",
];

fn is_bookkeeping(field: &str) -> bool {
    BOOKKEEPING_FIELDS.contains(&field)
}

// =============================================================================
// Resolution Context
// =============================================================================

/// Everything the resolver needs about one conflicting entity.
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub entity_type: String,
    pub entity_id: String,
    pub tenant_id: String,
    pub local: Value,
    pub remote: Value,
    pub local_updated_at: DateTime<Utc>,
    pub remote_updated_at: DateTime<Utc>,
    pub local_version: Option<i64>,
    pub remote_version: Option<i64>,
}

impl ResolutionContext {
    /// Builds a context, deriving timestamps and versions from the rows.
    /// Missing timestamps default to the epoch, so a side with no
    /// `updated_at` always loses a freshness comparison.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        tenant_id: impl Into<String>,
        local: Value,
        remote: Value,
    ) -> Self {
        let epoch = Utc.timestamp_millis_opt(0).single().unwrap_or_else(Utc::now);
        let local_updated_at = row_updated_at(&local).unwrap_or(epoch);
        let remote_updated_at = row_updated_at(&remote).unwrap_or(epoch);
        let local_version = row_version(&local);
        let remote_version = row_version(&remote);

        ResolutionContext {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            tenant_id: tenant_id.into(),
            local,
            remote,
            local_updated_at,
            remote_updated_at,
            local_version,
            remote_version,
        }
    }

    fn local_is_empty(&self) -> bool {
        match &self.local {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Which record the caller should write.
#[derive(Debug, Clone, PartialEq)]
pub enum ChosenRecord {
    /// Keep the local row untouched.
    Local,
    /// Write the remote row as-is.
    Remote,
    /// Write this merged row.
    Merged(Value),
}

/// The resolver's verdict for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub chosen: ChosenRecord,
    /// What the audit log records for this decision.
    pub resolution: ConflictResolution,
    /// True when an admin should look at this conflict.
    pub needs_review: bool,
}

impl Decision {
    fn remote_wins() -> Self {
        Decision {
            chosen: ChosenRecord::Remote,
            resolution: ConflictResolution::RemoteWins,
            needs_review: false,
        }
    }

    fn local_wins() -> Self {
        Decision {
            chosen: ChosenRecord::Local,
            resolution: ConflictResolution::LocalWins,
            needs_review: false,
        }
    }

    /// The record to upsert, or `None` when the local row stays.
    pub fn record_to_apply<'a>(&'a self, remote: &'a Value) -> Option<&'a Value> {
        match &self.chosen {
            ChosenRecord::Local => None,
            ChosenRecord::Remote => Some(remote),
            ChosenRecord::Merged(merged) => Some(merged),
        }
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolves one local/remote pair into a [`Decision`].
pub fn resolve(ctx: &ResolutionContext) -> Decision {
    // No local row at all: the remote record is simply new here.
    if ctx.local_is_empty() {
        return Decision::remote_wins();
    }

    match classify(&ctx.entity_type) {
        EntityClass::Reference => last_write_wins(ctx),
        EntityClass::Operational => field_merge(ctx),
        EntityClass::Financial => version_aware(ctx),
    }
}

/// Last-write-wins: newer `updated_at` survives; ties go to remote.
fn last_write_wins(ctx: &ResolutionContext) -> Decision {
    if ctx.remote_updated_at >= ctx.local_updated_at {
        Decision::remote_wins()
    } else {
        Decision::local_wins()
    }
}

/// Field-merge: diff the non-bookkeeping fields and let the fresher
/// side's values win per field.
fn field_merge(ctx: &ResolutionContext) -> Decision {
    let delta = changed_fields(&ctx.local, &ctx.remote);

    if delta.is_empty() {
        return Decision::remote_wins();
    }

    if ctx.local_updated_at > ctx.remote_updated_at {
        return Decision {
            chosen: ChosenRecord::Merged(build_merged(ctx, &delta)),
            resolution: ConflictResolution::Merged,
            needs_review: false,
        };
    }

    if ctx.remote_updated_at > ctx.local_updated_at {
        return Decision::remote_wins();
    }

    // Same instant, different data: no safe automatic winner. Take the
    // remote row so the tenant converges, but flag it.
    Decision {
        chosen: ChosenRecord::Remote,
        resolution: ConflictResolution::PendingReview,
        needs_review: true,
    }
}

/// Version-aware resolution for financial records: a version gap wider
/// than one accepted write means concurrent edits we must not clobber.
fn version_aware(ctx: &ResolutionContext) -> Decision {
    if let (Some(local_v), Some(remote_v)) = (ctx.local_version, ctx.remote_version) {
        if local_v > 0 && remote_v > 0 && (remote_v - local_v).abs() > 1 {
            return Decision {
                chosen: ChosenRecord::Local,
                resolution: ConflictResolution::PendingReview,
                needs_review: true,
            };
        }
    }
    field_merge(ctx)
}

// =============================================================================
// Diff & Merge
// =============================================================================

/// The set of non-bookkeeping fields whose values differ between the two
/// rows. A field present on one side only counts as different.
pub fn changed_fields(local: &Value, remote: &Value) -> BTreeSet<String> {
    let empty = Map::new();
    let local_map = local.as_object().unwrap_or(&empty);
    let remote_map = remote.as_object().unwrap_or(&empty);

    let mut delta = BTreeSet::new();
    for key in local_map.keys().chain(remote_map.keys()) {
        if is_bookkeeping(key) || delta.contains(key) {
            continue;
        }
        if local_map.get(key) != remote_map.get(key) {
            delta.insert(key.clone());
        }
    }
    delta
}

/// Builds the merged record: the remote row with the delta fields
/// overwritten by local values. The local `updated_at` is carried so the
/// merged row is a fixed point: resolving it against the same remote
/// reproduces it instead of bouncing to review.
fn build_merged(ctx: &ResolutionContext, delta: &BTreeSet<String>) -> Value {
    let mut merged = ctx.remote.clone();

    if let (Some(merged_map), Some(local_map)) = (merged.as_object_mut(), ctx.local.as_object()) {
        for field in delta {
            if let Some(value) = local_map.get(field) {
                merged_map.insert(field.clone(), value.clone());
            }
        }

        for ts_key in ["updated_at", "updatedAt"] {
            if let Some(local_ts) = local_map.get(ts_key) {
                merged_map.insert(ts_key.to_string(), local_ts.clone());
            }
        }
    }

    merged
}
