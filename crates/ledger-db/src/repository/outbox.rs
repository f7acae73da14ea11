//! # Sync Outbox Repository
//!
//! The durable FIFO of pending local writes, one queue per tenant.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Pattern Implementation                        │
//! │                                                                         │
//! │  LOCAL MUTATION (e.g., save_invoice)                                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │                                                                 │   │
//! │  │  1. Upsert the entity row                                      │   │
//! │  │                                                                 │   │
//! │  │  2. Supersede pending outbox items for the same entity,        │   │
//! │  │     then INSERT the new item (status = 'pending')              │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← Both succeed or both fail (atomicity guaranteed)             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  UPSTREAM DRIVER drains oldest-first, in dependency order              │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • The mutation is never lost (it's in the local store)                │
//! │  • The outbox item is never orphaned (same transaction)                │
//! │  • Offline? Entries queue up. Back online? The driver drains them.     │
//! │  • Item id doubles as the idempotency key: the server deduplicates     │
//! │    retries of the same item                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Deduplication
//! A fresh `enqueue` for an entity that already has `pending` items
//! supersedes them, so only the latest intent is transmitted (a storm of
//! edits costs one round trip, and an offline create-then-delete sends
//! only the delete). `failed` items are never superseded; they need an
//! explicit retry or resolution.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use ledger_core::ids::{new_id, now, parse_iso, to_iso};
use ledger_core::{OutboxItem, OutboxStatus, SyncAction, MAX_ERROR_MESSAGE_LEN};

// =============================================================================
// Row Mapping
// =============================================================================

/// Raw row as stored; timestamps and enums stay textual until converted.
#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: String,
    tenant_id: String,
    user_id: Option<String>,
    entity_type: String,
    action: String,
    entity_id: String,
    payload_json: Option<String>,
    created_at: String,
    updated_at: String,
    synced_at: Option<String>,
    status: String,
    retry_count: i64,
    error_message: Option<String>,
}

impl OutboxRow {
    fn into_item(self) -> DbResult<OutboxItem> {
        let action: SyncAction = self
            .action
            .parse()
            .map_err(|e: String| corrupt_row(&self.id, e))?;
        let status: OutboxStatus = self
            .status
            .parse()
            .map_err(|e: String| corrupt_row(&self.id, e))?;
        let payload = match &self.payload_json {
            Some(json) => Some(
                serde_json::from_str(json).map_err(|e| corrupt_row(&self.id, e.to_string()))?,
            ),
            None => None,
        };
        let created_at = parse_row_ts(&self.id, &self.created_at)?;
        let updated_at = parse_row_ts(&self.id, &self.updated_at)?;
        let synced_at = match &self.synced_at {
            Some(ts) => Some(parse_row_ts(&self.id, ts)?),
            None => None,
        };

        Ok(OutboxItem {
            id: self.id,
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            entity_type: self.entity_type,
            action,
            entity_id: self.entity_id,
            payload,
            created_at,
            updated_at,
            synced_at,
            status,
            retry_count: self.retry_count,
            error_message: self.error_message,
        })
    }
}

fn corrupt_row(id: &str, message: String) -> DbError {
    DbError::CorruptPayload {
        entity: "sync_outbox".into(),
        id: id.to_string(),
        message,
    }
}

fn parse_row_ts(id: &str, raw: &str) -> DbResult<DateTime<Utc>> {
    parse_iso(raw).ok_or_else(|| corrupt_row(id, format!("bad timestamp: {raw}")))
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for sync outbox operations.
#[derive(Debug, Clone)]
pub struct OutboxRepository {
    pool: SqlitePool,
}

impl OutboxRepository {
    /// Creates a new OutboxRepository.
    pub(crate) fn new(pool: SqlitePool) -> Self {
        OutboxRepository { pool }
    }

    /// Queues a local mutation for upstream push. Atomic.
    ///
    /// Returns the inserted item; its `id` is the idempotency key the
    /// upstream driver will transmit.
    pub async fn enqueue(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        entity_type: &str,
        action: SyncAction,
        entity_id: &str,
        payload: Option<&Value>,
    ) -> DbResult<OutboxItem> {
        let mut tx = self.pool.begin().await?;
        let item = enqueue_in(
            &mut tx,
            tenant_id,
            user_id,
            entity_type,
            action,
            entity_id,
            payload,
        )
        .await?;
        tx.commit().await?;
        Ok(item)
    }

    /// Returns drainable items (`pending` or `failed`) for a tenant,
    /// oldest `created_at` first.
    pub async fn get_pending(&self, tenant_id: &str) -> DbResult<Vec<OutboxItem>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, user_id, entity_type, action, entity_id,
                   payload_json, created_at, updated_at, synced_at,
                   status, retry_count, error_message
            FROM sync_outbox
            WHERE tenant_id = ?1 AND status IN ('pending', 'failed')
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutboxRow::into_item).collect()
    }

    /// Fetches one item by ID.
    pub async fn get(&self, id: &str) -> DbResult<Option<OutboxItem>> {
        let row: Option<OutboxRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, user_id, entity_type, action, entity_id,
                   payload_json, created_at, updated_at, synced_at,
                   status, retry_count, error_message
            FROM sync_outbox
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboxRow::into_item).transpose()
    }

    /// Moves an item to `syncing`.
    pub async fn mark_syncing(&self, id: &str) -> DbResult<()> {
        sqlx::query("UPDATE sync_outbox SET status = 'syncing', updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(to_iso(now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves an item to `synced` and stamps `synced_at`.
    pub async fn mark_synced(&self, id: &str) -> DbResult<()> {
        let ts = to_iso(now());
        sqlx::query(
            r#"
            UPDATE sync_outbox
            SET status = 'synced', synced_at = ?2, updated_at = ?2, error_message = NULL
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a push failure: bumps `retry_count` and stores the error
    /// truncated to 500 chars.
    pub async fn mark_failed(&self, id: &str, error: &str) -> DbResult<()> {
        let message = truncate_error(error);
        sqlx::query(
            r#"
            UPDATE sync_outbox
            SET status = 'failed',
                retry_count = retry_count + 1,
                error_message = ?2,
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(message)
        .bind(to_iso(now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bulk-closes every open item for one entity. Used when a push
    /// response tells us the server already reflects the latest state
    /// (duplicate create, non-retriable rejection): retrying any queued
    /// write for that entity is pointless.
    pub async fn mark_all_synced_for_entity(
        &self,
        tenant_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> DbResult<u64> {
        let ts = to_iso(now());
        let result = sqlx::query(
            r#"
            UPDATE sync_outbox
            SET status = 'synced', synced_at = ?4, updated_at = ?4
            WHERE tenant_id = ?1 AND entity_type = ?2 AND entity_id = ?3
              AND status != 'synced'
            "#,
        )
        .bind(tenant_id)
        .bind(entity_type)
        .bind(entity_id)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        debug!(
            tenant_id = %tenant_id,
            entity_type = %entity_type,
            entity_id = %entity_id,
            closed = result.rows_affected(),
            "Bulk-closed outbox items for entity"
        );

        Ok(result.rows_affected())
    }

    /// Counts drainable items for a tenant.
    pub async fn pending_count(&self, tenant_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_outbox WHERE tenant_id = ?1 AND status IN ('pending', 'failed')",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Deletes `synced` items older than the given number of days.
    pub async fn clear_synced_older_than(&self, tenant_id: &str, days: u32) -> DbResult<u64> {
        let cutoff = to_iso(now() - chrono::Duration::days(i64::from(days)));
        let result = sqlx::query(
            r#"
            DELETE FROM sync_outbox
            WHERE tenant_id = ?1 AND status = 'synced'
              AND synced_at IS NOT NULL AND synced_at < ?2
            "#,
        )
        .bind(tenant_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Transaction-Scoped Insert
// =============================================================================

/// Inserts an outbox item inside an existing transaction, superseding any
/// `pending` items for the same entity first. Shared by [`OutboxRepository::enqueue`]
/// and the entity store's capture path so the mutation and its outbox
/// entry commit together.
pub(crate) async fn enqueue_in(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    user_id: Option<&str>,
    entity_type: &str,
    action: SyncAction,
    entity_id: &str,
    payload: Option<&Value>,
) -> DbResult<OutboxItem> {
    // Supersede: only the latest intent for an entity is transmitted.
    // Failed items stay; they must be explicitly resolved.
    let superseded = sqlx::query(
        r#"
        DELETE FROM sync_outbox
        WHERE tenant_id = ?1 AND entity_type = ?2 AND entity_id = ?3
          AND status = 'pending'
        "#,
    )
    .bind(tenant_id)
    .bind(entity_type)
    .bind(entity_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if superseded > 0 {
        debug!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            superseded,
            "Superseded pending outbox items"
        );
    }

    let ts = now();
    let item = OutboxItem {
        id: new_id(),
        tenant_id: tenant_id.to_string(),
        user_id: user_id.map(str::to_string),
        entity_type: entity_type.to_string(),
        action,
        entity_id: entity_id.to_string(),
        payload: payload.cloned(),
        created_at: ts,
        updated_at: ts,
        synced_at: None,
        status: OutboxStatus::Pending,
        retry_count: 0,
        error_message: None,
    };

    let payload_json = item
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO sync_outbox (
            id, tenant_id, user_id, entity_type, action, entity_id,
            payload_json, created_at, updated_at, status, retry_count
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 'pending', 0)
        "#,
    )
    .bind(&item.id)
    .bind(&item.tenant_id)
    .bind(&item.user_id)
    .bind(&item.entity_type)
    .bind(item.action.to_string())
    .bind(&item.entity_id)
    .bind(payload_json)
    .bind(to_iso(ts))
    .execute(&mut *conn)
    .await?;

    Ok(item)
}

/// Truncates a failure message to the stored limit, on a char boundary.
fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_MESSAGE_LEN).collect()
}

// =============================================================================
// Tests
// =============================================================================
