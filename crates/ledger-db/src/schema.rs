//! # Schema Bootstrap
//!
//! Embedded `CREATE TABLE IF NOT EXISTS` statements applied at pool
//! creation. Idempotent: safe to run on every startup.
//!
//! ## Persisted Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Local Store Tables                                │
//! │                                                                         │
//! │  sync_outbox      durable FIFO of pending local writes per tenant      │
//! │  sync_metadata    pull/push watermarks per (tenant, entity_type)       │
//! │  sync_conflicts   append-only audit of resolver decisions              │
//! │  record_locks     cooperative short-TTL edit locks                     │
//! │  <entity type>    one table per entity type: (id PK, bookkeeping       │
//! │                   columns, full row as JSON)                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Timestamps are stored as ISO-8601 UTC text with a fixed millisecond
//! shape, so lexicographic comparison in SQL agrees with chronological
//! comparison.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};

/// Sync-internal tables, created unconditionally.
const SYNC_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_outbox (
        id            TEXT PRIMARY KEY,
        tenant_id     TEXT NOT NULL,
        user_id       TEXT,
        entity_type   TEXT NOT NULL,
        action        TEXT NOT NULL,
        entity_id     TEXT NOT NULL,
        payload_json  TEXT,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL,
        synced_at     TEXT,
        status        TEXT NOT NULL DEFAULT 'pending',
        retry_count   INTEGER NOT NULL DEFAULT 0,
        error_message TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sync_outbox_tenant_status
        ON sync_outbox(tenant_id, status, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sync_outbox_entity
        ON sync_outbox(tenant_id, entity_type, entity_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_metadata (
        tenant_id      TEXT NOT NULL,
        entity_type    TEXT NOT NULL,
        last_synced_at TEXT,
        last_pull_at   TEXT,
        updated_at     TEXT NOT NULL,
        PRIMARY KEY (tenant_id, entity_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_conflicts (
        id               TEXT PRIMARY KEY,
        tenant_id        TEXT NOT NULL,
        entity_type      TEXT NOT NULL,
        entity_id        TEXT NOT NULL,
        local_version    INTEGER,
        remote_version   INTEGER,
        local_data_json  TEXT,
        remote_data_json TEXT,
        resolution       TEXT NOT NULL,
        resolved_by      TEXT NOT NULL,
        device_id        TEXT,
        created_at       TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_tenant
        ON sync_conflicts(tenant_id, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS record_locks (
        id          TEXT PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id   TEXT NOT NULL,
        user_id     TEXT NOT NULL,
        user_name   TEXT,
        tenant_id   TEXT,
        expires_at  TEXT NOT NULL,
        created_at  TEXT NOT NULL
    )
    "#,
];

/// Creates the sync-internal tables and their indexes.
pub async fn bootstrap(pool: &SqlitePool) -> DbResult<()> {
    debug!("Bootstrapping sync tables");
    for statement in SYNC_TABLES {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DbError::SchemaFailed(e.to_string()))?;
    }
    Ok(())
}

/// Validates that an entity type can safely name a SQLite table.
///
/// Entity types come from the wire on downstream pulls; anything outside
/// `[a-z0-9_]` is rejected before it reaches a SQL string.
pub fn validate_entity_type(entity_type: &str) -> DbResult<()> {
    let ok = !entity_type.is_empty()
        && entity_type.len() <= 64
        && entity_type
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(DbError::InvalidEntityType(entity_type.to_string()))
    }
}

/// Creates one entity table if it does not exist yet.
///
/// Every entity table has the same shape: the immutable `id`, the
/// bookkeeping columns used for filtering, and the full row as JSON.
pub async fn ensure_entity_table(pool: &SqlitePool, entity_type: &str) -> DbResult<()> {
    validate_entity_type(entity_type)?;
    let statement = format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{entity_type}" (
            id         TEXT PRIMARY KEY,
            tenant_id  TEXT,
            version    INTEGER,
            updated_at TEXT,
            data       TEXT NOT NULL
        )
        "#
    );
    sqlx::query(&statement)
        .execute(pool)
        .await
        .map_err(|e| DbError::SchemaFailed(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_validation() {
        assert!(validate_entity_type("transactions").is_ok());
        assert!(validate_entity_type("payroll_salary_components").is_ok());
        assert!(validate_entity_type("units").is_ok());
    }

    #[test]
    fn test_entity_type_rejects_sql() {
        assert!(validate_entity_type("").is_err());
        assert!(validate_entity_type("Drop Table").is_err());
        assert!(validate_entity_type("users;--").is_err());
        assert!(validate_entity_type("entités").is_err());
    }
}
