//! # Upstream Driver
//!
//! Drains the outbox for a tenant in dependency order, pushing each item
//! to the remote API with its idempotency key and optimistic version,
//! and interpreting the server's verdict per item.
//!
//! ## Drain Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Upstream Drain (one pass)                         │
//! │                                                                         │
//! │  get_pending(T)  (oldest-first)                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  stable sort by dependency rank (parents before children)              │
//! │       │                                                                 │
//! │       ▼  per item                                                       │
//! │  ├── tenant guard: item.tenant ≠ T     → mark_failed, never sent       │
//! │  ├── lock deferral: other user editing → skip, retry next sync         │
//! │  ├── "sys-" entity id                  → mark_synced (never pushed)    │
//! │  └── mark_syncing → push →                                             │
//! │         Accepted          → mark_synced,                pushed++       │
//! │         Duplicate         → close all items for entity, pushed++       │
//! │         VersionConflict   → log server_wins, mark_synced, pushed++     │
//! │         NotRetriable      → close all items for entity, pushed++       │
//! │         Failed / Err      → mark_failed (retry later),  failed++       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  pushed > 0 ⇒ set_last_synced_at(T, "_global", now)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::ConflictLogger;
use crate::error::SyncResult;
use crate::locks::LockManager;
use crate::remote::{PushOutcome, RemoteApi};
use ledger_core::deps::sort_by_dependency;
use ledger_core::ids::now;
use ledger_core::{OutboxItem, UpstreamReport, GLOBAL_ENTITY_TYPE, SYSTEM_ID_PREFIX};
use ledger_db::Database;

/// Pushes pending local writes to the authoritative store.
pub struct UpstreamDriver {
    db: Database,
    remote: Arc<dyn RemoteApi>,
    locks: Arc<LockManager>,
    logger: ConflictLogger,
    /// Current user; locks held by anyone else defer the push.
    user_id: String,
}

impl UpstreamDriver {
    /// Creates an upstream driver.
    pub fn new(
        db: Database,
        remote: Arc<dyn RemoteApi>,
        locks: Arc<LockManager>,
        logger: ConflictLogger,
        user_id: impl Into<String>,
    ) -> Self {
        UpstreamDriver {
            db,
            remote,
            locks,
            logger,
            user_id: user_id.into(),
        }
    }

    /// Drains the outbox for `tenant_id` once.
    pub async fn run(&self, tenant_id: &str) -> SyncResult<UpstreamReport> {
        let outbox = self.db.outbox();
        let mut items = outbox.get_pending(tenant_id).await?;

        if items.is_empty() {
            debug!(tenant_id = %tenant_id, "Outbox empty, nothing to push");
            return Ok(UpstreamReport::default());
        }

        // FIFO within an entity type is preserved; across types parents
        // go first so the server never sees a child before its parent.
        sort_by_dependency(&mut items, |item| item.entity_type.as_str());

        info!(tenant_id = %tenant_id, count = items.len(), "Draining outbox");

        let mut report = UpstreamReport::default();
        for item in &items {
            self.process_item(tenant_id, item, &mut report).await?;
        }

        if report.pushed > 0 {
            self.db
                .metadata()
                .set_last_synced_at(tenant_id, GLOBAL_ENTITY_TYPE, now())
                .await?;
        }

        info!(
            tenant_id = %tenant_id,
            pushed = report.pushed,
            failed = report.failed,
            "Upstream drive complete"
        );
        Ok(report)
    }

    /// Pushes one item and settles its outbox state.
    pub(crate) async fn process_item(
        &self,
        tenant_id: &str,
        item: &OutboxItem,
        report: &mut UpstreamReport,
    ) -> SyncResult<()> {
        let outbox = self.db.outbox();

        // Tenant guard, independent of the server's own checks: a write
        // tagged for another tenant is never transmitted.
        if item.tenant_id != tenant_id {
            warn!(
                item_id = %item.id,
                item_tenant = %item.tenant_id,
                active_tenant = %tenant_id,
                "Outbox item failed tenant guard"
            );
            outbox.mark_failed(&item.id, "tenant mismatch").await?;
            report.failed += 1;
            return Ok(());
        }

        // Lock deferral: another user is editing this entity right now.
        // Leave the item untouched; the next sync retries it.
        if self
            .locks
            .is_locked_by_other(&item.entity_type, &item.entity_id, &self.user_id)
            .await
        {
            debug!(
                entity_type = %item.entity_type,
                entity_id = %item.entity_id,
                "Entity locked by another user, deferring push"
            );
            return Ok(());
        }

        // System-seeded records never leave the device.
        if item.entity_id.starts_with(SYSTEM_ID_PREFIX) {
            outbox.mark_synced(&item.id).await?;
            return Ok(());
        }

        outbox.mark_syncing(&item.id).await?;

        match self.remote.push(item).await {
            Ok(PushOutcome::Accepted) => {
                outbox.mark_synced(&item.id).await?;
                report.pushed += 1;
            }

            Ok(PushOutcome::Duplicate) => {
                // The server already has this entity; every queued write
                // for it is moot.
                debug!(
                    entity_type = %item.entity_type,
                    entity_id = %item.entity_id,
                    "Server reports duplicate, closing entity's outbox items"
                );
                outbox
                    .mark_all_synced_for_entity(tenant_id, &item.entity_type, &item.entity_id)
                    .await?;
                report.pushed += 1;
            }

            Ok(PushOutcome::VersionConflict { server_version }) => {
                // Our optimistic version lost. Stop retrying; the next
                // downstream pull delivers the authoritative row.
                info!(
                    entity_type = %item.entity_type,
                    entity_id = %item.entity_id,
                    ?server_version,
                    "Version conflict, server wins"
                );
                self.logger
                    .record_server_wins(
                        tenant_id,
                        &item.entity_type,
                        &item.entity_id,
                        item.payload.as_ref(),
                        server_version,
                    )
                    .await;
                outbox.mark_synced(&item.id).await?;
                report.pushed += 1;
            }

            Ok(PushOutcome::NotRetriable { code, message }) => {
                warn!(
                    entity_type = %item.entity_type,
                    entity_id = %item.entity_id,
                    code = %code,
                    message = %message,
                    "Non-retriable rejection, server state is canonical"
                );
                outbox
                    .mark_all_synced_for_entity(tenant_id, &item.entity_type, &item.entity_id)
                    .await?;
                report.pushed += 1;
            }

            Ok(PushOutcome::Failed { status, message }) => {
                outbox
                    .mark_failed(&item.id, &format!("HTTP {status}: {message}"))
                    .await?;
                report.failed += 1;
            }

            Err(e) => {
                outbox.mark_failed(&item.id, &e.to_string()).await?;
                report.failed += 1;
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedRemote;
    use chrono::Duration as ChronoDuration;
    use ledger_core::{OutboxStatus, SyncAction};
    use ledger_db::DbConfig;
    use serde_json::json;

    struct Fixture {
        db: Database,
        remote: Arc<ScriptedRemote>,
        locks: Arc<LockManager>,
        driver: UpstreamDriver,
    }

    async fn fixture() -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(ScriptedRemote::new());
        let locks = Arc::new(LockManager::new(
            db.locks(),
            remote.clone(),
            None,
            ChronoDuration::minutes(5),
        ));
        let logger = ConflictLogger::new(db.conflicts(), "dev-1");
        let driver = UpstreamDriver::new(
            db.clone(),
            remote.clone(),
            locks.clone(),
            logger,
            "u1",
        );
        Fixture {
            db,
            remote,
            locks,
            driver,
        }
    }

    #[tokio::test]
    async fn test_offline_create_then_push() {
        let f = fixture().await;

        // Offline: the mutation waits in the outbox.
        let item = f
            .db
            .outbox()
            .enqueue(
                "T",
                Some("u1"),
                "transactions",
                SyncAction::Create,
                "t1",
                Some(&json!({"id": "t1", "tenant_id": "T", "version": 1, "amount": 100,
                             "updated_at": "2025-01-01T10:00:00.000Z"})),
            )
            .await
            .unwrap();
        assert_eq!(f.db.outbox().pending_count("T").await.unwrap(), 1);

        // Online: the drive pushes it with the item id as idempotency key.
        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report, UpstreamReport { pushed: 1, failed: 0 });
        assert_eq!(f.remote.idempotency_keys(), vec![item.id.clone()]);

        let synced = f.db.outbox().get(&item.id).await.unwrap().unwrap();
        assert_eq!(synced.status, OutboxStatus::Synced);

        let watermark = f
            .db
            .metadata()
            .get_last_synced_at("T", GLOBAL_ENTITY_TYPE)
            .await
            .unwrap();
        assert!(watermark.is_some());
    }

    #[tokio::test]
    async fn test_idempotency_key_not_reused_after_success() {
        let f = fixture().await;
        let item = f
            .db
            .outbox()
            .enqueue("T", None, "contacts", SyncAction::Create, "c1", Some(&json!({"id": "c1"})))
            .await
            .unwrap();

        f.driver.run("T").await.unwrap();
        // A second drive has nothing left; the key is never re-sent.
        f.driver.run("T").await.unwrap();
        assert_eq!(f.remote.idempotency_keys(), vec![item.id]);
    }

    #[tokio::test]
    async fn test_items_push_in_dependency_order() {
        let f = fixture().await;
        let outbox = f.db.outbox();

        // Enqueued child-first; the drive must still push parents first.
        outbox
            .enqueue("T", None, "transactions", SyncAction::Create, "t1",
                Some(&json!({"id": "t1", "contact_id": "c9"})))
            .await
            .unwrap();
        outbox
            .enqueue("T", None, "invoices", SyncAction::Create, "i1", Some(&json!({"id": "i1"})))
            .await
            .unwrap();
        outbox
            .enqueue("T", None, "contacts", SyncAction::Create, "c9", Some(&json!({"id": "c9"})))
            .await
            .unwrap();

        f.driver.run("T").await.unwrap();
        assert_eq!(f.remote.pushed_entity_ids(), vec!["c9", "i1", "t1"]);
    }

    #[tokio::test]
    async fn test_duplicate_closes_all_items_for_entity() {
        let f = fixture().await;
        f.db
            .outbox()
            .enqueue("T", None, "transactions", SyncAction::Create, "t1",
                Some(&json!({"id": "t1"})))
            .await
            .unwrap();
        f.remote
            .script_push("t1", PushOutcome::Duplicate);

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(f.db.outbox().pending_count("T").await.unwrap(), 0);
        // Duplicates are not conflicts.
        assert!(f.db.conflicts().recent("T", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_conflict_logs_server_wins_and_stops_retry() {
        let f = fixture().await;
        let item = f
            .db
            .outbox()
            .enqueue("T", None, "invoices", SyncAction::Update, "i1",
                Some(&json!({"id": "i1", "version": 3})))
            .await
            .unwrap();
        f.remote.script_push(
            "i1",
            PushOutcome::VersionConflict {
                server_version: Some(5),
            },
        );

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report.pushed, 1);

        let synced = f.db.outbox().get(&item.id).await.unwrap().unwrap();
        assert_eq!(synced.status, OutboxStatus::Synced);

        let conflicts = f.db.conflicts().recent("T", 10).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution.to_string(), "server_wins");
        assert_eq!(conflicts[0].local_version, Some(3));
        assert_eq!(conflicts[0].remote_version, Some(5));
    }

    #[tokio::test]
    async fn test_not_retriable_closes_entity() {
        let f = fixture().await;
        f.db
            .outbox()
            .enqueue("T", None, "transactions", SyncAction::Update, "t1",
                Some(&json!({"id": "t1", "amount": 500})))
            .await
            .unwrap();
        f.remote.script_push(
            "t1",
            PushOutcome::NotRetriable {
                code: "PAYMENT_OVERPAYMENT".into(),
                message: "would exceed balance".into(),
            },
        );

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report, UpstreamReport { pushed: 1, failed: 0 });
        assert_eq!(f.db.outbox().pending_count("T").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_marks_failed_then_retries() {
        let f = fixture().await;
        let item = f
            .db
            .outbox()
            .enqueue("T", None, "bills", SyncAction::Update, "b1", Some(&json!({"id": "b1"})))
            .await
            .unwrap();
        f.remote.script_push_error("b1", "connection reset");

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report, UpstreamReport { pushed: 0, failed: 1 });

        let failed = f.db.outbox().get(&item.id).await.unwrap().unwrap();
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert_eq!(failed.retry_count, 1);

        // Next drive: default outcome is Accepted, the item completes.
        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report, UpstreamReport { pushed: 1, failed: 0 });
        let synced = f.db.outbox().get(&item.id).await.unwrap().unwrap();
        assert_eq!(synced.status, OutboxStatus::Synced);
    }

    #[tokio::test]
    async fn test_locked_entity_is_deferred_untouched() {
        let f = fixture().await;
        let item = f
            .db
            .outbox()
            .enqueue("T", None, "invoices", SyncAction::Update, "i1", Some(&json!({"id": "i1"})))
            .await
            .unwrap();

        // Another user is editing the invoice.
        f.locks.acquire("invoices", "i1", "u2", None, Some("T")).await.unwrap();

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report, UpstreamReport { pushed: 0, failed: 0 });
        assert!(f.remote.pushes.lock().unwrap().is_empty());

        // Untouched: still pending, no retry burned.
        let untouched = f.db.outbox().get(&item.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, OutboxStatus::Pending);
        assert_eq!(untouched.retry_count, 0);
    }

    #[tokio::test]
    async fn test_system_entities_are_never_pushed() {
        let f = fixture().await;
        let item = f
            .db
            .outbox()
            .enqueue("T", None, "categories", SyncAction::Update, "sys-defaults",
                Some(&json!({"id": "sys-defaults"})))
            .await
            .unwrap();

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report, UpstreamReport { pushed: 0, failed: 0 });
        assert!(f.remote.pushes.lock().unwrap().is_empty());

        let closed = f.db.outbox().get(&item.id).await.unwrap().unwrap();
        assert_eq!(closed.status, OutboxStatus::Synced);
    }

    #[tokio::test]
    async fn test_tenant_guard_blocks_foreign_item() {
        let f = fixture().await;

        // A crafted item whose tenant disagrees with the active tenant;
        // defense-in-depth, independent of the outbox query's own filter.
        let foreign = OutboxItem {
            id: "item-x".into(),
            tenant_id: "OTHER".into(),
            user_id: None,
            entity_type: "contacts".into(),
            action: SyncAction::Update,
            entity_id: "c1".into(),
            payload: Some(json!({"id": "c1"})),
            created_at: now(),
            updated_at: now(),
            synced_at: None,
            status: OutboxStatus::Pending,
            retry_count: 0,
            error_message: None,
        };

        let mut report = UpstreamReport::default();
        f.driver.process_item("T", &foreign, &mut report).await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(f.remote.pushes.lock().unwrap().is_empty());
    }
}
