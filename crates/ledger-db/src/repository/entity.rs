//! # Generic Entity Store
//!
//! Reads and writes application entity rows across the per-type tables.
//! Rows travel as schemaless JSON; the store extracts the bookkeeping
//! columns (`tenant_id`, `version`, `updated_at`) for filtering and keeps
//! the full row in the `data` column.
//!
//! ## Two Write Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  LOCAL MUTATION ──► save_local()                                       │
//! │    one transaction: upsert entity row + enqueue outbox item            │
//! │    (capture; skipped while a remote apply is in progress)              │
//! │                                                                         │
//! │  REMOTE APPLY ──► apply_chunk()                                        │
//! │    one dedicated connection: FK enforcement off, one transaction       │
//! │    per chunk, FK enforcement restored on every exit                    │
//! │    (never captures; remote rows are not local mutations)               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::Value;
use sqlx::{Connection, SqliteConnection, SqlitePool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::outbox::enqueue_in;
use crate::schema::{ensure_entity_table, validate_entity_type};
use ledger_core::{row_id, row_updated_at, row_version, OutboxItem, SyncAction};

/// Repository for the generic entity tables.
#[derive(Debug, Clone)]
pub struct EntityRepository {
    pool: SqlitePool,
    capture_enabled: Arc<AtomicBool>,
}

impl EntityRepository {
    /// Creates a new EntityRepository.
    pub(crate) fn new(pool: SqlitePool, capture_enabled: Arc<AtomicBool>) -> Self {
        EntityRepository {
            pool,
            capture_enabled,
        }
    }

    /// Creates any missing entity tables for the given types.
    pub async fn ensure_tables(&self, entity_types: &[&str]) -> DbResult<()> {
        for entity_type in entity_types {
            ensure_entity_table(&self.pool, entity_type).await?;
        }
        Ok(())
    }

    /// Fetches one entity row by ID.
    pub async fn get(&self, entity_type: &str, id: &str) -> DbResult<Option<Value>> {
        validate_entity_type(entity_type)?;
        let data: Option<String> =
            sqlx::query_scalar(&format!(r#"SELECT data FROM "{entity_type}" WHERE id = ?1"#))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        data.map(|json| {
            serde_json::from_str(&json).map_err(|e| DbError::CorruptPayload {
                entity: entity_type.to_string(),
                id: id.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
    }

    /// Upserts one row, keyed on `id`. Idempotent; never captures.
    pub async fn upsert(&self, entity_type: &str, row: &Value) -> DbResult<()> {
        validate_entity_type(entity_type)?;
        let mut conn = self.pool.acquire().await?;
        upsert_in(&mut conn, entity_type, row).await
    }

    /// Deletes one row by ID. Never captures.
    pub async fn delete(&self, entity_type: &str, id: &str) -> DbResult<()> {
        validate_entity_type(entity_type)?;
        sqlx::query(&format!(r#"DELETE FROM "{entity_type}" WHERE id = ?1"#))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Applies a local mutation: writes the entity row and, when capture
    /// is on, enqueues the matching outbox item in the same transaction.
    ///
    /// Returns the enqueued item, or `None` when capture was suspended.
    pub async fn save_local(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        entity_type: &str,
        action: SyncAction,
        entity_id: &str,
        row: Option<&Value>,
    ) -> DbResult<Option<OutboxItem>> {
        validate_entity_type(entity_type)?;

        let mut tx = self.pool.begin().await?;

        match (action, row) {
            (SyncAction::Delete, _) => {
                sqlx::query(&format!(r#"DELETE FROM "{entity_type}" WHERE id = ?1"#))
                    .bind(entity_id)
                    .execute(&mut *tx)
                    .await?;
            }
            (_, Some(row)) => upsert_in(&mut tx, entity_type, row).await?,
            (_, None) => {
                return Err(DbError::Internal(format!(
                    "{action} for {entity_type}/{entity_id} requires a row"
                )));
            }
        }

        let item = if self.capture_enabled.load(Ordering::SeqCst) {
            let payload = if action == SyncAction::Delete { None } else { row };
            Some(
                enqueue_in(
                    &mut tx,
                    tenant_id,
                    user_id,
                    entity_type,
                    action,
                    entity_id,
                    payload,
                )
                .await?,
            )
        } else {
            debug!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                "Capture suspended, skipping outbox enqueue"
            );
            None
        };

        tx.commit().await?;
        Ok(item)
    }

    /// Writes one chunk of remote rows with FK enforcement suspended.
    ///
    /// The remote is authoritative: ordering is best-effort and server
    /// validation guarantees eventual FK integrity, so a rare inversion
    /// inside a chunk must not abort the apply. The whole chunk runs on
    /// one dedicated connection inside one transaction; enforcement is
    /// restored on that connection on every exit.
    pub async fn apply_chunk(&self, writes: &[(String, Value)]) -> DbResult<()> {
        for (entity_type, _) in writes {
            validate_entity_type(entity_type)?;
        }

        let mut conn = self.pool.acquire().await?;

        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await?;

        let applied = apply_chunk_tx(&mut conn, writes).await;

        let restored = sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await;

        applied?;
        restored?;
        Ok(())
    }
}

/// Runs the chunk's writes in a single transaction on `conn`.
async fn apply_chunk_tx(conn: &mut SqliteConnection, writes: &[(String, Value)]) -> DbResult<()> {
    let mut tx = conn.begin().await?;
    for (entity_type, row) in writes {
        upsert_in(&mut tx, entity_type, row).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Upserts one row on an existing connection or transaction.
///
/// Caller has validated `entity_type`.
async fn upsert_in(conn: &mut SqliteConnection, entity_type: &str, row: &Value) -> DbResult<()> {
    let id = row_id(row).ok_or_else(|| DbError::Internal(format!(
        "{entity_type} row has no id"
    )))?;

    let tenant_id = ledger_core::row_tenant(row).map(str::to_string);
    let version = row_version(row);
    let updated_at = row_updated_at(row).map(ledger_core::ids::to_iso);
    let data = serde_json::to_string(row)?;

    sqlx::query(&format!(
        r#"
        INSERT INTO "{entity_type}" (id, tenant_id, version, updated_at, data)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (id) DO UPDATE SET
            tenant_id = excluded.tenant_id,
            version = excluded.version,
            updated_at = excluded.updated_at,
            data = excluded.data
        "#
    ))
    .bind(id)
    .bind(tenant_id)
    .bind(version)
    .bind(updated_at)
    .bind(data)
    .execute(conn)
    .await?;

    Ok(())
}
