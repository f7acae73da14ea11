//! # Downstream Driver
//!
//! Pulls the remote delta since the last watermark and applies it to the
//! local store through the conflict resolver, in dependency order, in
//! chunks that yield cooperatively so the UI stays responsive.
//!
//! ## Apply Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Downstream Apply (one pass)                        │
//! │                                                                         │
//! │  ensure entity tables → since = last_pull_at(T) → pull_since(since)    │
//! │       │                              (pull failure ⇒ zero counters)    │
//! │       ▼                                                                 │
//! │  collect rows: drop no-id rows, drop foreign-tenant rows (guard)       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  stable sort by dependency rank (parents before children)              │
//! │       │                                                                 │
//! │       ▼  suspend outbox capture for the whole apply                    │
//! │  per chunk of 200:                                                     │
//! │    resolve(local, remote) per row:                                     │
//! │      use_local   → skipped++        (log conflict)                     │
//! │      use_remote  → write row        (log unless remote_wins)           │
//! │      use_merged  → write merged row (log merged)                       │
//! │      needs_review → conflicts++                                        │
//! │    apply chunk (FK enforcement off for the chunk's transaction)        │
//! │    emit progress + chunk_applied, then YIELD to the scheduler          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  set_last_pull_at(T, now)   (monotonic)                                │
//! │  applied > 0 ⇒ emit downstream_complete(applied)                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::audit::ConflictLogger;
use crate::error::SyncResult;
use crate::events::{ChunkApplied, SyncEventEmitter};
use crate::remote::RemoteApi;
use ledger_core::deps::{sort_by_dependency, DEPENDENCY_ORDER};
use ledger_core::ids::now;
use ledger_core::resolver::{resolve, ChosenRecord, ResolutionContext};
use ledger_core::{
    row_id, row_tenant, tenant_keys_diverge, ConflictResolution, DownstreamReport,
};
use ledger_db::schema::validate_entity_type;
use ledger_db::Database;

/// Applies remote changes to the local store.
pub struct DownstreamDriver {
    db: Database,
    remote: Arc<dyn RemoteApi>,
    logger: ConflictLogger,
    emitter: Arc<dyn SyncEventEmitter>,
    /// Rows applied per cooperative chunk.
    chunk_size: usize,
}

impl DownstreamDriver {
    /// Creates a downstream driver.
    pub fn new(
        db: Database,
        remote: Arc<dyn RemoteApi>,
        logger: ConflictLogger,
        emitter: Arc<dyn SyncEventEmitter>,
        chunk_size: usize,
    ) -> Self {
        DownstreamDriver {
            db,
            remote,
            logger,
            emitter,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Pulls and applies the delta for `tenant_id` once.
    ///
    /// A failed pull or an uninitialized store aborts with zero counters;
    /// the next sync simply retries from the same watermark.
    pub async fn run(&self, tenant_id: &str) -> SyncResult<DownstreamReport> {
        let entities = self.db.entities();

        if let Err(e) = entities.ensure_tables(DEPENDENCY_ORDER).await {
            warn!(?e, "Local store unavailable, skipping downstream");
            return Ok(DownstreamReport::default());
        }

        let since = self.db.metadata().get_last_pull_at(tenant_id).await?;

        let batch = match self.remote.pull_since(since).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(?e, "Delta pull failed, skipping downstream");
                return Ok(DownstreamReport::default());
            }
        };

        let mut report = DownstreamReport::default();

        // Collect guarded (entity_type, row) pairs.
        let mut rows: Vec<(String, Value)> = Vec::with_capacity(batch.row_count());
        for (entity_type, entity_rows) in batch.entities {
            if validate_entity_type(&entity_type).is_err() {
                error!(entity_type = %entity_type, "Delta carries an invalid entity type, dropping");
                report.skipped += entity_rows.len() as u64;
                continue;
            }
            // New entity types from the wire still get a table.
            entities.ensure_tables(&[entity_type.as_str()]).await?;

            for row in entity_rows {
                if row_id(&row).is_none() {
                    debug!(entity_type = %entity_type, "Pulled row has no id, dropping");
                    report.skipped += 1;
                    continue;
                }

                // Tenant guard, independent of the server: a row from
                // another tenant is never applied.
                if let Some(row_tenant_id) = row_tenant(&row) {
                    if row_tenant_id != tenant_id {
                        error!(
                            entity_type = %entity_type,
                            row_tenant = %row_tenant_id,
                            active_tenant = %tenant_id,
                            "Pulled row failed tenant guard, dropping"
                        );
                        report.skipped += 1;
                        continue;
                    }
                }
                if tenant_keys_diverge(&row) {
                    warn!(
                        entity_type = %entity_type,
                        "Row carries diverging tenant_id and org_id, trusting tenant_id"
                    );
                }

                rows.push((entity_type.clone(), row));
            }
        }

        // Parents before children; FIFO preserved within a rank.
        sort_by_dependency(&mut rows, |(entity_type, _)| entity_type.as_str());

        let total = rows.len() as u64;
        info!(tenant_id = %tenant_id, total, "Applying remote delta");

        // Remote rows are not local mutations: keep them out of the
        // outbox for the whole apply. Restored on every exit by Drop.
        let _capture_guard = self.db.suspend_capture();

        for chunk in rows.chunks(self.chunk_size) {
            let mut writes: Vec<(String, Value)> = Vec::with_capacity(chunk.len());

            for (entity_type, remote_row) in chunk {
                // row_id checked during collection
                let Some(entity_id) = row_id(remote_row).map(str::to_string) else {
                    continue;
                };

                let local = entities.get(entity_type, &entity_id).await?;
                let local_exists = local.is_some();

                let ctx = ResolutionContext::new(
                    entity_type.clone(),
                    entity_id.clone(),
                    tenant_id,
                    local.unwrap_or_else(|| json!({})),
                    remote_row.clone(),
                );
                let decision = resolve(&ctx);

                // Every non-trivial decision is audited with both
                // snapshots; plain remote_wins over existing data is the
                // routine case and stays quiet.
                if local_exists && decision.resolution != ConflictResolution::RemoteWins {
                    self.logger
                        .record(
                            tenant_id,
                            entity_type,
                            &entity_id,
                            Some(&ctx.local),
                            Some(&ctx.remote),
                            decision.resolution,
                        )
                        .await;
                }
                if decision.needs_review {
                    report.conflicts += 1;
                }

                match decision.chosen {
                    ChosenRecord::Local => {
                        report.skipped += 1;
                    }
                    ChosenRecord::Remote => {
                        writes.push((entity_type.clone(), remote_row.clone()));
                        report.applied += 1;
                    }
                    ChosenRecord::Merged(merged) => {
                        writes.push((entity_type.clone(), merged));
                        report.applied += 1;
                    }
                }
            }

            if !writes.is_empty() {
                entities.apply_chunk(&writes).await?;
            }

            self.emitter.emit_progress(report.applied, total);
            let chunk_event = ChunkApplied::from_writes(&writes);
            if !chunk_event.is_empty() {
                self.emitter.emit_chunk_applied(&chunk_event);
            }

            // Surrender the task so UI and event handlers interleave.
            tokio::task::yield_now().await;
        }

        self.db.metadata().set_last_pull_at(tenant_id, now()).await?;

        if report.applied > 0 {
            self.emitter.emit_downstream_complete(report.applied);
        }

        info!(
            tenant_id = %tenant_id,
            applied = report.applied,
            skipped = report.skipped,
            conflicts = report.conflicts,
            "Downstream drive complete"
        );
        Ok(report)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncStatus;
    use crate::testutil::ScriptedRemote;
    use ledger_db::DbConfig;
    use std::sync::Mutex;

    /// Emitter that records progress and chunk events.
    #[derive(Default)]
    struct RecordingEmitter {
        progress: Mutex<Vec<(u64, u64)>>,
        chunks: Mutex<Vec<ChunkApplied>>,
        completions: Mutex<Vec<u64>>,
    }

    impl SyncEventEmitter for RecordingEmitter {
        fn emit_status(&self, _status: &SyncStatus) {}
        fn emit_progress(&self, applied_so_far: u64, total: u64) {
            self.progress.lock().unwrap().push((applied_so_far, total));
        }
        fn emit_chunk_applied(&self, chunk: &ChunkApplied) {
            self.chunks.lock().unwrap().push(chunk.clone());
        }
        fn emit_downstream_complete(&self, applied: u64) {
            self.completions.lock().unwrap().push(applied);
        }
        fn emit_error(&self, _message: &str, _retryable: bool) {}
    }

    struct Fixture {
        db: Database,
        remote: Arc<ScriptedRemote>,
        emitter: Arc<RecordingEmitter>,
        driver: DownstreamDriver,
    }

    async fn fixture_with_chunk(chunk_size: usize) -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(ScriptedRemote::new());
        let emitter = Arc::new(RecordingEmitter::default());
        let logger = ConflictLogger::new(db.conflicts(), "dev-1");
        let driver = DownstreamDriver::new(
            db.clone(),
            remote.clone(),
            logger,
            emitter.clone(),
            chunk_size,
        );
        Fixture {
            db,
            remote,
            emitter,
            driver,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_chunk(200).await
    }

    #[tokio::test]
    async fn test_fresh_pull_applies_rows_and_advances_watermark() {
        let f = fixture().await;
        f.remote.script_pull_json(
            r#"{"entities":{"contacts":[
                {"id":"c1","tenant_id":"T","version":1,"name":"Asha",
                 "updated_at":"2025-01-01T10:00:00.000Z"}
            ]}}"#,
        );

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.conflicts, 0);

        let stored = f.db.entities().get("contacts", "c1").await.unwrap().unwrap();
        assert_eq!(stored["name"], "Asha");

        let watermark = f.db.metadata().get_last_pull_at("T").await.unwrap();
        assert!(watermark.timestamp_millis() > 0);
        assert_eq!(*f.emitter.completions.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_pull_failure_returns_zero_and_keeps_watermark() {
        let f = fixture().await;
        f.remote.script_pull_error("gateway down");

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report, DownstreamReport::default());

        let watermark = f.db.metadata().get_last_pull_at("T").await.unwrap();
        assert_eq!(watermark.timestamp_millis(), 0);
    }

    #[tokio::test]
    async fn test_dependency_order_parents_first() {
        // Chunk size 1 makes the apply order observable via chunk events.
        let f = fixture_with_chunk(1).await;
        f.remote.script_pull_json(
            r#"{"entities":{
                "transactions":[{"id":"x","tenant_id":"T","contact_id":"c9"}],
                "contacts":[{"id":"c9","tenant_id":"T"}]
            }}"#,
        );

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report.applied, 2);

        let chunks = f.emitter.chunks.lock().unwrap();
        let order: Vec<&str> = chunks
            .iter()
            .flat_map(|c| c.entities.keys().map(String::as_str))
            .collect();
        assert_eq!(order, vec!["contacts", "transactions"]);
    }

    #[tokio::test]
    async fn test_tenant_guard_drops_foreign_rows() {
        let f = fixture().await;
        f.remote.script_pull_json(
            r#"{"entities":{"contacts":[
                {"id":"ours","tenant_id":"T"},
                {"id":"theirs","tenant_id":"EVIL"}
            ]}}"#,
        );

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);

        assert!(f.db.entities().get("contacts", "ours").await.unwrap().is_some());
        assert!(f.db.entities().get("contacts", "theirs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_org_id_is_accepted_as_tenant_key() {
        let f = fixture().await;
        f.remote.script_pull_json(
            r#"{"entities":{"rental_agreements":[
                {"id":"r1","org_id":"T","unit_id":"u1"}
            ]}}"#,
        );

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(f
            .db
            .entities()
            .get("rental_agreements", "r1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_rows_without_id_are_skipped() {
        let f = fixture().await;
        f.remote
            .script_pull_json(r#"{"entities":{"contacts":[{"tenant_id":"T","name":"no id"}]}}"#);

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_financial_version_gap_keeps_local_and_flags_review() {
        let f = fixture().await;

        // Local financial record at version 2.
        f.db.entities().ensure_tables(&["transactions"]).await.unwrap();
        f.db.entities()
            .upsert(
                "transactions",
                &serde_json::json!({"id":"t1","tenant_id":"T","version":2,"amount":100,
                     "updated_at":"2025-01-01T10:00:00.000Z"}),
            )
            .await
            .unwrap();

        // Remote arrives at version 5: a gap of 3.
        f.remote.script_pull_json(
            r#"{"entities":{"transactions":[
                {"id":"t1","tenant_id":"T","version":5,"amount":120,
                 "updated_at":"2025-01-01T10:00:01.000Z"}
            ]}}"#,
        );

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.conflicts, 1);

        // Locally-held financial data is untouched.
        let stored = f.db.entities().get("transactions", "t1").await.unwrap().unwrap();
        assert_eq!(stored["amount"], 100);
        assert_eq!(stored["version"], 2);

        let conflicts = f.db.conflicts().recent("T", 10).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution.to_string(), "pending_review");
        assert_eq!(f.db.conflicts().pending_review_count("T").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_newer_remote_wins_quietly_over_existing_row() {
        let f = fixture().await;
        f.db.entities().ensure_tables(&["contacts"]).await.unwrap();
        f.db.entities()
            .upsert(
                "contacts",
                &serde_json::json!({"id":"c1","tenant_id":"T","name":"Old",
                     "updated_at":"2025-01-01T10:00:00.000Z"}),
            )
            .await
            .unwrap();

        f.remote.script_pull_json(
            r#"{"entities":{"contacts":[
                {"id":"c1","tenant_id":"T","name":"New",
                 "updated_at":"2025-01-01T11:00:00.000Z"}
            ]}}"#,
        );

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts, 0);

        let stored = f.db.entities().get("contacts", "c1").await.unwrap().unwrap();
        assert_eq!(stored["name"], "New");
        // Routine remote_wins is not an auditable conflict.
        assert!(f.db.conflicts().recent("T", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chunked_apply_emits_progress_per_chunk() {
        let f = fixture_with_chunk(2).await;
        f.remote.script_pull_json(
            r#"{"entities":{"contacts":[
                {"id":"c1","tenant_id":"T"},
                {"id":"c2","tenant_id":"T"},
                {"id":"c3","tenant_id":"T"},
                {"id":"c4","tenant_id":"T"},
                {"id":"c5","tenant_id":"T"}
            ]}}"#,
        );

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report.applied, 5);

        let progress = f.emitter.progress.lock().unwrap();
        assert_eq!(*progress, vec![(2, 5), (4, 5), (5, 5)]);
        assert_eq!(f.emitter.chunks.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_apply_never_feeds_the_outbox() {
        let f = fixture().await;
        f.remote.script_pull_json(
            r#"{"entities":{"invoices":[{"id":"i1","tenant_id":"T","version":1}]}}"#,
        );

        f.driver.run("T").await.unwrap();
        assert_eq!(f.db.outbox().pending_count("T").await.unwrap(), 0);
        // Capture is restored after the drive.
        assert!(f.db.capture_enabled());
    }

    #[tokio::test]
    async fn test_merge_applies_local_fields_over_newer_payload() {
        let f = fixture().await;
        f.db.entities().ensure_tables(&["contacts"]).await.unwrap();
        // Local edit is newer than the pulled row.
        f.db.entities()
            .upsert(
                "contacts",
                &serde_json::json!({"id":"c1","tenant_id":"T","name":"Mine","phone":"111",
                     "updated_at":"2025-01-01T12:00:00.000Z"}),
            )
            .await
            .unwrap();

        f.remote.script_pull_json(
            r#"{"entities":{"contacts":[
                {"id":"c1","tenant_id":"T","name":"Theirs","phone":"111","email":"c@x.io",
                 "version":4,"updated_at":"2025-01-01T11:00:00.000Z"}
            ]}}"#,
        );

        let report = f.driver.run("T").await.unwrap();
        assert_eq!(report.applied, 1);

        let stored = f.db.entities().get("contacts", "c1").await.unwrap().unwrap();
        // Local field won, remote-only field survived.
        assert_eq!(stored["name"], "Mine");
        assert_eq!(stored["email"], "c@x.io");

        let conflicts = f.db.conflicts().recent("T", 10).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution.to_string(), "merged");
    }
}
