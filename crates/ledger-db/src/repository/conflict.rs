//! # Conflict Log Repository
//!
//! Append-only audit of every resolver decision: both data snapshots,
//! both versions, and the resolution string. Admin surfaces read it back
//! through `recent` and `pending_review_count`.
//!
//! Callers swallow write failures (a broken audit row must never fail a
//! sync); that policy lives in the engine's logger wrapper, not here.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use ledger_core::ids::{parse_iso, to_iso};
use ledger_core::{ConflictLogEntry, ConflictResolution};

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ConflictRow {
    id: String,
    tenant_id: String,
    entity_type: String,
    entity_id: String,
    local_version: Option<i64>,
    remote_version: Option<i64>,
    local_data_json: Option<String>,
    remote_data_json: Option<String>,
    resolution: String,
    resolved_by: String,
    device_id: Option<String>,
    created_at: String,
}

impl ConflictRow {
    fn into_entry(self) -> DbResult<ConflictLogEntry> {
        let resolution: ConflictResolution = self
            .resolution
            .parse()
            .map_err(|e: String| corrupt_row(&self.id, e))?;
        let created_at: DateTime<Utc> = parse_iso(&self.created_at).ok_or_else(|| {
            corrupt_row(&self.id, format!("bad timestamp: {}", self.created_at))
        })?;
        let local_data = parse_snapshot(&self.id, self.local_data_json.as_deref())?;
        let remote_data = parse_snapshot(&self.id, self.remote_data_json.as_deref())?;

        Ok(ConflictLogEntry {
            id: self.id,
            tenant_id: self.tenant_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            local_version: self.local_version,
            remote_version: self.remote_version,
            local_data,
            remote_data,
            resolution,
            resolved_by: self.resolved_by,
            device_id: self.device_id,
            created_at,
        })
    }
}

fn corrupt_row(id: &str, message: String) -> DbError {
    DbError::CorruptPayload {
        entity: "sync_conflicts".into(),
        id: id.to_string(),
        message,
    }
}

fn parse_snapshot(id: &str, json: Option<&str>) -> DbResult<Option<Value>> {
    json.map(|raw| serde_json::from_str(raw).map_err(|e| corrupt_row(id, e.to_string())))
        .transpose()
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the conflict audit table.
#[derive(Debug, Clone)]
pub struct ConflictRepository {
    pool: SqlitePool,
}

impl ConflictRepository {
    /// Creates a new ConflictRepository.
    pub(crate) fn new(pool: SqlitePool) -> Self {
        ConflictRepository { pool }
    }

    /// Appends one decision. Rows are never updated or deleted.
    pub async fn append(&self, entry: &ConflictLogEntry) -> DbResult<()> {
        let local_json = entry
            .local_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let remote_json = entry
            .remote_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO sync_conflicts (
                id, tenant_id, entity_type, entity_id,
                local_version, remote_version, local_data_json, remote_data_json,
                resolution, resolved_by, device_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.tenant_id)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.local_version)
        .bind(entry.remote_version)
        .bind(local_json)
        .bind(remote_json)
        .bind(entry.resolution.to_string())
        .bind(&entry.resolved_by)
        .bind(&entry.device_id)
        .bind(to_iso(entry.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent decisions for a tenant, newest first.
    pub async fn recent(&self, tenant_id: &str, limit: u32) -> DbResult<Vec<ConflictLogEntry>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, entity_type, entity_id,
                   local_version, remote_version, local_data_json, remote_data_json,
                   resolution, resolved_by, device_id, created_at
            FROM sync_conflicts
            WHERE tenant_id = ?1
            ORDER BY created_at DESC
            LIMIT ?2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictRow::into_entry).collect()
    }

    /// Number of conflicts awaiting admin review.
    pub async fn pending_review_count(&self, tenant_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_conflicts WHERE tenant_id = ?1 AND resolution = 'pending_review'",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
