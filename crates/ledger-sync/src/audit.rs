//! # Conflict Audit Logger
//!
//! Append-only writer of resolver decisions. Write failures are
//! swallowed: a broken audit row must never fail a sync. Admin surfaces
//! read back through `recent` and `pending_review_count`.

use serde_json::Value;
use tracing::warn;

use ledger_core::ids::{new_id, now};
use ledger_core::{row_version, ConflictLogEntry, ConflictResolution};
use ledger_db::{ConflictRepository, DbResult};

/// Audit logger shared by the drivers.
#[derive(Clone)]
pub struct ConflictLogger {
    conflicts: ConflictRepository,
    device_id: String,
}

impl ConflictLogger {
    /// Creates a logger stamping entries with this device's ID.
    pub fn new(conflicts: ConflictRepository, device_id: impl Into<String>) -> Self {
        ConflictLogger {
            conflicts,
            device_id: device_id.into(),
        }
    }

    /// Appends one decision. Versions are derived from the snapshots when
    /// present. Never fails; a write error is logged and dropped.
    pub async fn record(
        &self,
        tenant_id: &str,
        entity_type: &str,
        entity_id: &str,
        local: Option<&Value>,
        remote: Option<&Value>,
        resolution: ConflictResolution,
    ) {
        let entry = ConflictLogEntry {
            id: new_id(),
            tenant_id: tenant_id.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            local_version: local.and_then(row_version),
            remote_version: remote.and_then(row_version),
            local_data: local.cloned(),
            remote_data: remote.cloned(),
            resolution,
            resolved_by: "auto".to_string(),
            device_id: Some(self.device_id.clone()),
            created_at: now(),
        };

        if let Err(e) = self.conflicts.append(&entry).await {
            warn!(
                ?e,
                entity_type = %entity_type,
                entity_id = %entity_id,
                "Failed to write conflict log entry (swallowed)"
            );
        }
    }

    /// Records an optimistic-version rejection: the server refused our
    /// `X-Entity-Version` and reported its own. There is no remote
    /// snapshot yet; the next downstream pull delivers it.
    pub async fn record_server_wins(
        &self,
        tenant_id: &str,
        entity_type: &str,
        entity_id: &str,
        local: Option<&Value>,
        server_version: Option<i64>,
    ) {
        let entry = ConflictLogEntry {
            id: new_id(),
            tenant_id: tenant_id.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            local_version: local.and_then(row_version),
            remote_version: server_version,
            local_data: local.cloned(),
            remote_data: None,
            resolution: ConflictResolution::ServerWins,
            resolved_by: "auto".to_string(),
            device_id: Some(self.device_id.clone()),
            created_at: now(),
        };

        if let Err(e) = self.conflicts.append(&entry).await {
            warn!(
                ?e,
                entity_type = %entity_type,
                entity_id = %entity_id,
                "Failed to write server-wins conflict entry (swallowed)"
            );
        }
    }

    /// Most recent decisions for a tenant.
    pub async fn recent(&self, tenant_id: &str, limit: u32) -> DbResult<Vec<ConflictLogEntry>> {
        self.conflicts.recent(tenant_id, limit).await
    }

    /// Conflicts awaiting admin review.
    pub async fn pending_review_count(&self, tenant_id: &str) -> DbResult<i64> {
        self.conflicts.pending_review_count(tenant_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_db::{Database, DbConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_record_derives_versions_from_snapshots() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let logger = ConflictLogger::new(db.conflicts(), "dev-1");

        logger
            .record(
                "T",
                "invoices",
                "i1",
                Some(&json!({"id": "i1", "version": 3})),
                Some(&json!({"id": "i1", "version": 5})),
                ConflictResolution::ServerWins,
            )
            .await;

        let recent = logger.recent("T", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].local_version, Some(3));
        assert_eq!(recent[0].remote_version, Some(5));
        assert_eq!(recent[0].device_id.as_deref(), Some("dev-1"));
        assert_eq!(recent[0].resolved_by, "auto");
    }

    #[tokio::test]
    async fn test_pending_review_passthrough() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let logger = ConflictLogger::new(db.conflicts(), "dev-1");

        logger
            .record("T", "contacts", "c1", None, Some(&json!({"id": "c1"})),
                ConflictResolution::PendingReview)
            .await;

        assert_eq!(logger.pending_review_count("T").await.unwrap(), 1);
    }
}
