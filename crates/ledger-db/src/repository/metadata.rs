//! # Sync Metadata Repository
//!
//! Watermark storage, one row per `(tenant_id, entity_type)` with the
//! synthetic type `_global` for tenant-wide cursors.
//!
//! `last_pull_at` is the downstream cursor and is monotonic
//! non-decreasing: a stale write can never move it backwards. Watermarks
//! are stored as fixed-shape ISO-8601 text, so the SQL `MAX`/comparison
//! on strings agrees with chronological order.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;

use crate::error::DbResult;
use ledger_core::ids::{now, parse_iso, to_iso};
use ledger_core::GLOBAL_ENTITY_TYPE;

/// Repository for sync watermark operations.
#[derive(Debug, Clone)]
pub struct MetadataRepository {
    pool: SqlitePool,
}

impl MetadataRepository {
    /// Creates a new MetadataRepository.
    pub(crate) fn new(pool: SqlitePool) -> Self {
        MetadataRepository { pool }
    }

    /// Returns the downstream watermark for a tenant, defaulting to the
    /// epoch when no pull has happened yet.
    pub async fn get_last_pull_at(&self, tenant_id: &str) -> DbResult<DateTime<Utc>> {
        let stored: Option<Option<String>> = sqlx::query_scalar(
            "SELECT last_pull_at FROM sync_metadata WHERE tenant_id = ?1 AND entity_type = ?2",
        )
        .bind(tenant_id)
        .bind(GLOBAL_ENTITY_TYPE)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stored
            .flatten()
            .as_deref()
            .and_then(parse_iso)
            .unwrap_or_else(epoch))
    }

    /// Advances the downstream watermark. Monotonic: an earlier value
    /// than the stored one is ignored.
    pub async fn set_last_pull_at(&self, tenant_id: &str, ts: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (tenant_id, entity_type, last_pull_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (tenant_id, entity_type) DO UPDATE SET
                last_pull_at = MAX(COALESCE(last_pull_at, ''), excluded.last_pull_at),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(GLOBAL_ENTITY_TYPE)
        .bind(to_iso(ts))
        .bind(to_iso(now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns the upstream watermark for `(tenant, entity_type)`.
    pub async fn get_last_synced_at(
        &self,
        tenant_id: &str,
        entity_type: &str,
    ) -> DbResult<Option<DateTime<Utc>>> {
        let stored: Option<Option<String>> = sqlx::query_scalar(
            "SELECT last_synced_at FROM sync_metadata WHERE tenant_id = ?1 AND entity_type = ?2",
        )
        .bind(tenant_id)
        .bind(entity_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stored.flatten().as_deref().and_then(parse_iso))
    }

    /// Records a successful upstream push for `(tenant, entity_type)`.
    pub async fn set_last_synced_at(
        &self,
        tenant_id: &str,
        entity_type: &str,
        ts: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (tenant_id, entity_type, last_synced_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (tenant_id, entity_type) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(entity_type)
        .bind(to_iso(ts))
        .bind(to_iso(now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(0).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::Duration;

    async fn test_db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_pull_watermark_defaults_to_epoch() {
        let db = test_db().await;
        let at = db.metadata().get_last_pull_at("T").await.unwrap();
        assert_eq!(at.timestamp_millis(), 0);
    }

    #[tokio::test]
    async fn test_pull_watermark_round_trip() {
        let db = test_db().await;
        let meta = db.metadata();
        let ts = now();

        meta.set_last_pull_at("T", ts).await.unwrap();
        let stored = meta.get_last_pull_at("T").await.unwrap();
        assert_eq!(stored.timestamp_millis(), ts.timestamp_millis());
    }

    #[tokio::test]
    async fn test_pull_watermark_is_monotonic() {
        let db = test_db().await;
        let meta = db.metadata();
        let ts = now();

        meta.set_last_pull_at("T", ts).await.unwrap();
        // A stale writer cannot move the cursor backwards.
        meta.set_last_pull_at("T", ts - Duration::hours(1)).await.unwrap();

        let stored = meta.get_last_pull_at("T").await.unwrap();
        assert_eq!(stored.timestamp_millis(), ts.timestamp_millis());
    }

    #[tokio::test]
    async fn test_synced_watermark_per_entity_type() {
        let db = test_db().await;
        let meta = db.metadata();
        let ts = now();

        meta.set_last_synced_at("T", "_global", ts).await.unwrap();
        meta.set_last_synced_at("T", "invoices", ts + Duration::seconds(5))
            .await
            .unwrap();

        let global = meta.get_last_synced_at("T", "_global").await.unwrap().unwrap();
        let invoices = meta.get_last_synced_at("T", "invoices").await.unwrap().unwrap();
        assert!(invoices > global);
        assert!(meta.get_last_synced_at("T", "bills").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watermarks_are_tenant_scoped() {
        let db = test_db().await;
        let meta = db.metadata();

        meta.set_last_pull_at("T1", now()).await.unwrap();
        let other = meta.get_last_pull_at("T2").await.unwrap();
        assert_eq!(other.timestamp_millis(), 0);
    }
}
