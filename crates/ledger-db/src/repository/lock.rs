//! # Record Lock Repository
//!
//! Persistence for the lock manager's in-memory map. Rows survive a
//! restart so a crashed client's own locks reload (and expire normally);
//! the lock manager is the single writer, other components read.
//!
//! Row id is the composite key `"<entity_type>:<entity_id>"`; `created_at`
//! stores the acquisition instant.

use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use ledger_core::ids::{parse_iso, to_iso};
use ledger_core::RecordLock;

#[derive(Debug, sqlx::FromRow)]
struct LockRow {
    id: String,
    entity_type: String,
    entity_id: String,
    user_id: String,
    user_name: Option<String>,
    tenant_id: Option<String>,
    expires_at: String,
    created_at: String,
}

impl LockRow {
    fn into_lock(self) -> DbResult<RecordLock> {
        let corrupt = |id: &str, message: &str| DbError::CorruptPayload {
            entity: "record_locks".into(),
            id: id.to_string(),
            message: message.to_string(),
        };

        let locked_at =
            parse_iso(&self.created_at).ok_or_else(|| corrupt(&self.id, "bad created_at"))?;
        let expires_at =
            parse_iso(&self.expires_at).ok_or_else(|| corrupt(&self.id, "bad expires_at"))?;

        Ok(RecordLock {
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            user_id: self.user_id,
            user_name: self.user_name,
            tenant_id: self.tenant_id,
            locked_at,
            expires_at,
        })
    }
}

/// Repository for record lock persistence.
#[derive(Debug, Clone)]
pub struct LockRepository {
    pool: SqlitePool,
}

impl LockRepository {
    /// Creates a new LockRepository.
    pub(crate) fn new(pool: SqlitePool) -> Self {
        LockRepository { pool }
    }

    /// Loads every persisted lock, expired ones included; the lock
    /// manager filters on load.
    pub async fn load_all(&self) -> DbResult<Vec<RecordLock>> {
        let rows: Vec<LockRow> = sqlx::query_as(
            r#"
            SELECT id, entity_type, entity_id, user_id, user_name, tenant_id,
                   expires_at, created_at
            FROM record_locks
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LockRow::into_lock).collect()
    }

    /// Inserts or replaces one lock row.
    pub async fn save(&self, lock: &RecordLock) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO record_locks (
                id, entity_type, entity_id, user_id, user_name, tenant_id,
                expires_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (id) DO UPDATE SET
                user_id = excluded.user_id,
                user_name = excluded.user_name,
                tenant_id = excluded.tenant_id,
                expires_at = excluded.expires_at,
                created_at = excluded.created_at
            "#,
        )
        .bind(lock.key())
        .bind(&lock.entity_type)
        .bind(&lock.entity_id)
        .bind(&lock.user_id)
        .bind(&lock.user_name)
        .bind(&lock.tenant_id)
        .bind(to_iso(lock.expires_at))
        .bind(to_iso(lock.locked_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes one lock row by its composite key.
    pub async fn delete(&self, key: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM record_locks WHERE id = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes every lock that expired at or before `cutoff`.
    pub async fn delete_expired(&self, cutoff: chrono::DateTime<chrono::Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM record_locks WHERE expires_at <= ?1")
            .bind(to_iso(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::Duration;
    use ledger_core::ids::now;

    fn lock(entity_id: &str, ttl_secs: i64) -> RecordLock {
        let at = now();
        RecordLock {
            entity_type: "invoices".into(),
            entity_id: entity_id.into(),
            user_id: "u1".into(),
            user_name: Some("Asha".into()),
            tenant_id: Some("T".into()),
            locked_at: at,
            expires_at: at + Duration::seconds(ttl_secs),
        }
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let locks = db.locks();

        let original = lock("i1", 300);
        locks.save(&original).await.unwrap();

        let loaded = locks.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].user_id, "u1");
        assert_eq!(loaded[0].key(), "invoices:i1");
        assert_eq!(
            loaded[0].expires_at.timestamp_millis(),
            original.expires_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_save_is_upsert_on_key() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let locks = db.locks();

        locks.save(&lock("i1", 300)).await.unwrap();
        let mut extended = lock("i1", 600);
        extended.user_name = Some("Noor".into());
        locks.save(&extended).await.unwrap();

        let loaded = locks.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].user_name.as_deref(), Some("Noor"));
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let locks = db.locks();

        let mut stale = lock("old", 300);
        stale.expires_at = stale.locked_at - Duration::minutes(10);
        locks.save(&stale).await.unwrap();
        locks.save(&lock("fresh", 300)).await.unwrap();

        let removed = locks.delete_expired(now()).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = locks.load_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].entity_id, "fresh");
    }

    #[tokio::test]
    async fn test_delete_by_key() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let locks = db.locks();

        locks.save(&lock("i1", 300)).await.unwrap();
        locks.delete("invoices:i1").await.unwrap();
        assert!(locks.load_all().await.unwrap().is_empty());
    }
}
