//! # Remote API Client
//!
//! The engine's view of the authoritative store: entity push, delta pull,
//! and best-effort lock replication. [`RemoteApi`] is object-safe so
//! tests swap in an in-memory fake; [`HttpRemoteApi`] is the one real
//! implementation.
//!
//! ## Wire Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Remote API Surface                               │
//! │                                                                         │
//! │  PUSH (per outbox item)                                                │
//! │  ──────────────────────                                                │
//! │  create|update ───► POST /<endpoint>            body: entity row       │
//! │  delete        ───► DELETE /<endpoint>/<id>                            │
//! │  headers: Idempotency-Key: <outbox item id>                            │
//! │           X-Entity-Version: <version>  (when payload carries one)      │
//! │                                                                         │
//! │  PULL (incremental)                                                    │
//! │  ──────────────────                                                    │
//! │  GET /sync/changes?since=<ISO-8601>                                    │
//! │  ◄─── { "entities": { "<entity_type>": [row, …], … } }                 │
//! │                                                                         │
//! │  LOCKS (best-effort)                                                   │
//! │  ───────────────────                                                   │
//! │  POST /locks { entity, entity_id, user_id, … }                         │
//! │  DELETE /locks/<entity>/<entity_id>                                    │
//! │  404 ⇒ feature optional, lock stays local-only                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Response Interpretation
//! The server's error semantics are part of the contract; the driver's
//! retry policy hangs off [`PushOutcome`]:
//!
//! | Response | Outcome |
//! |---|---|
//! | 2xx | `Accepted` |
//! | 409 + "duplicate"/"already exists" | `Duplicate` (server has it) |
//! | 409 otherwise | `VersionConflict { server_version }` |
//! | 409/500 + code `TRANSACTION_IMMUTABLE` | `NotRetriable` |
//! | 400 + `PAYMENT_OVERPAYMENT` on transactions | `NotRetriable` |
//! | anything else non-2xx | `Failed` (transient; retried next sync) |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::config::ApiSettings;
use crate::error::{SyncError, SyncResult};
use ledger_core::ids::to_iso;
use ledger_core::{row_version, OutboxItem, RecordLock, SyncAction};

// =============================================================================
// Endpoint Mapping
// =============================================================================

/// Entity types whose URL path does not follow the hyphen-case rule.
const ENDPOINT_OVERRIDES: &[(&str, &str)] = &[
    ("payroll_departments", "/payroll/departments"),
    ("payroll_grades", "/payroll/grades"),
    ("payroll_salary_components", "/payroll/salary-components"),
    ("payroll_employees", "/payroll/employees"),
    ("payroll_runs", "/payroll/runs"),
    ("payslips", "/payroll/payslips"),
    ("pm_cycle_allocations", "/pm-cycles/allocations"),
];

/// Maps an entity type (snake_case) to its resource path (hyphen-case),
/// with a fixed override table for the exceptions.
pub fn endpoint_path(entity_type: &str) -> String {
    for (ty, path) in ENDPOINT_OVERRIDES {
        if *ty == entity_type {
            return (*path).to_string();
        }
    }
    format!("/{}", entity_type.replace('_', "-"))
}

// =============================================================================
// Push Outcome
// =============================================================================

/// What a push attempt means for the outbox item, decoded from the
/// server's status code and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// 2xx: the write is accepted.
    Accepted,

    /// The server already has this write; close every queued item for
    /// the entity.
    Duplicate,

    /// Optimistic version rejected; the server reports its version.
    /// Downstream pull will deliver the authoritative state.
    VersionConflict { server_version: Option<i64> },

    /// Semantically rejected for good; server state is canonical.
    NotRetriable { code: String, message: String },

    /// Transient failure; the item is retried on the next sync.
    Failed { status: u16, message: String },
}

/// Minimal shape of a server error body.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "serverVersion")]
    server_version: Option<i64>,
}

/// Decodes a non-2xx push response into a [`PushOutcome`]. Pure; the
/// whole §6 error contract is testable without HTTP.
pub fn interpret_push_response(entity_type: &str, status: u16, body: &str) -> PushOutcome {
    if (200..300).contains(&status) {
        return PushOutcome::Accepted;
    }

    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.code.as_deref().unwrap_or("");
    let message = parsed
        .message
        .clone()
        .unwrap_or_else(|| body.chars().take(200).collect());
    let message_lower = message.to_lowercase();

    // Payment bound to a settled invoice/bill: the server will never
    // accept a replay of this write.
    if (status == 409 || status == 500) && code == "TRANSACTION_IMMUTABLE" {
        return PushOutcome::NotRetriable {
            code: code.to_string(),
            message,
        };
    }

    // Overpayment on transactions: local retry is pointless, the server
    // balance is the source of truth.
    if status == 400
        && entity_type == "transactions"
        && (code == "PAYMENT_OVERPAYMENT"
            || message_lower.contains("overpayment")
            || message_lower.contains("would exceed"))
    {
        return PushOutcome::NotRetriable {
            code: "PAYMENT_OVERPAYMENT".to_string(),
            message,
        };
    }

    if status == 409 {
        if message_lower.contains("duplicate") || message_lower.contains("already exists") {
            return PushOutcome::Duplicate;
        }
        return PushOutcome::VersionConflict {
            server_version: parsed.server_version,
        };
    }

    PushOutcome::Failed { status, message }
}

// =============================================================================
// Delta Batch
// =============================================================================

/// Incremental pull result: every entity changed since the watermark,
/// keyed by entity type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeltaBatch {
    #[serde(default)]
    pub entities: BTreeMap<String, Vec<Value>>,
}

impl DeltaBatch {
    /// Total number of rows across entity types.
    pub fn row_count(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }
}

// =============================================================================
// Remote API Trait
// =============================================================================

/// The engine's interface to the authoritative store.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Pushes one outbox item. Transport failures are `Err`; any HTTP
    /// response, success or not, is an `Ok(PushOutcome)`.
    async fn push(&self, item: &OutboxItem) -> SyncResult<PushOutcome>;

    /// Pulls every entity changed since the given watermark.
    async fn pull_since(&self, since: DateTime<Utc>) -> SyncResult<DeltaBatch>;

    /// Best-effort lock replication. 404 means the server does not offer
    /// the lock feature; treated as success.
    async fn replicate_lock(&self, lock: &RecordLock) -> SyncResult<()>;

    /// Best-effort remote lock release.
    async fn release_lock(&self, entity_type: &str, entity_id: &str) -> SyncResult<()>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// [`RemoteApi`] over the tenant's HTTP API.
pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteApi {
    /// Builds the client from API settings.
    pub fn new(settings: &ApiSettings) -> SyncResult<Self> {
        if settings.base_url.is_empty() {
            return Err(SyncError::InvalidConfig("api.base_url is not set".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::Internal(e.to_string()))?;

        Ok(HttpRemoteApi {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn push(&self, item: &OutboxItem) -> SyncResult<PushOutcome> {
        let endpoint = endpoint_path(&item.entity_type);

        let request = match item.action {
            SyncAction::Create | SyncAction::Update => {
                let payload = item.payload.as_ref().ok_or_else(|| {
                    SyncError::Internal(format!("outbox item {} has no payload", item.id))
                })?;

                let mut request = self.client.post(self.url(&endpoint)).json(payload);
                if let Some(version) = row_version(payload) {
                    request = request.header("X-Entity-Version", version);
                }
                request
            }
            SyncAction::Delete => self
                .client
                .delete(self.url(&format!("{}/{}", endpoint, item.entity_id))),
        };

        let response = request
            .header("Idempotency-Key", item.id.as_str())
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        debug!(
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            status,
            "Push response"
        );

        Ok(interpret_push_response(&item.entity_type, status, &body))
    }

    async fn pull_since(&self, since: DateTime<Utc>) -> SyncResult<DeltaBatch> {
        let response = self
            .client
            .get(self.url("/sync/changes"))
            .query(&[("since", to_iso(since))])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::HttpStatus {
                status: status.as_u16(),
                message,
            });
        }

        let batch: DeltaBatch = response.json().await?;
        debug!(rows = batch.row_count(), "Pulled delta batch");
        Ok(batch)
    }

    async fn replicate_lock(&self, lock: &RecordLock) -> SyncResult<()> {
        let body = serde_json::json!({
            "entity": lock.entity_type,
            "entity_id": lock.entity_id,
            "user_id": lock.user_id,
            "user_name": lock.user_name,
            "tenant_id": lock.tenant_id,
            "locked_at": to_iso(lock.locked_at),
            "expires_at": to_iso(lock.expires_at),
        });

        let response = self.client.post(self.url("/locks")).json(&body).send().await?;
        let status = response.status();

        // 404: server has no lock service, lock stays local-only.
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            Err(SyncError::HttpStatus {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }

    async fn release_lock(&self, entity_type: &str, entity_id: &str) -> SyncResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/locks/{entity_type}/{entity_id}")))
            .send()
            .await?;
        let status = response.status();

        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            Err(SyncError::HttpStatus {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_hyphen_case() {
        assert_eq!(endpoint_path("transactions"), "/transactions");
        assert_eq!(endpoint_path("rental_agreements"), "/rental-agreements");
        assert_eq!(
            endpoint_path("recurring_invoice_templates"),
            "/recurring-invoice-templates"
        );
    }

    #[test]
    fn test_endpoint_overrides() {
        assert_eq!(endpoint_path("payroll_employees"), "/payroll/employees");
        assert_eq!(
            endpoint_path("payroll_salary_components"),
            "/payroll/salary-components"
        );
        assert_eq!(endpoint_path("payslips"), "/payroll/payslips");
    }

    #[test]
    fn test_2xx_is_accepted() {
        assert_eq!(
            interpret_push_response("invoices", 201, ""),
            PushOutcome::Accepted
        );
    }

    #[test]
    fn test_409_duplicate_detection() {
        let outcome =
            interpret_push_response("transactions", 409, r#"{"message":"already exists"}"#);
        assert_eq!(outcome, PushOutcome::Duplicate);

        let outcome = interpret_push_response(
            "transactions",
            409,
            r#"{"message":"Duplicate entry for key"}"#,
        );
        assert_eq!(outcome, PushOutcome::Duplicate);
    }

    #[test]
    fn test_409_version_conflict_carries_server_version() {
        let outcome = interpret_push_response(
            "invoices",
            409,
            r#"{"message":"version mismatch","serverVersion":5}"#,
        );
        assert_eq!(
            outcome,
            PushOutcome::VersionConflict {
                server_version: Some(5)
            }
        );
    }

    #[test]
    fn test_transaction_immutable_is_not_retriable() {
        for status in [409, 500] {
            let outcome = interpret_push_response(
                "transactions",
                status,
                r#"{"code":"TRANSACTION_IMMUTABLE","message":"payment is settled"}"#,
            );
            assert!(matches!(outcome, PushOutcome::NotRetriable { ref code, .. }
                if code == "TRANSACTION_IMMUTABLE"));
        }
    }

    #[test]
    fn test_overpayment_only_on_transactions() {
        let body = r#"{"code":"PAYMENT_OVERPAYMENT","message":"Overpayment: would exceed balance"}"#;

        let outcome = interpret_push_response("transactions", 400, body);
        assert!(matches!(outcome, PushOutcome::NotRetriable { .. }));

        // Same body on a different entity type is an ordinary failure.
        let outcome = interpret_push_response("invoices", 400, body);
        assert!(matches!(outcome, PushOutcome::Failed { status: 400, .. }));
    }

    #[test]
    fn test_overpayment_message_match_without_code() {
        let outcome = interpret_push_response(
            "transactions",
            400,
            r#"{"message":"amount would exceed the open balance"}"#,
        );
        assert!(matches!(outcome, PushOutcome::NotRetriable { .. }));
    }

    #[test]
    fn test_5xx_is_transient_failure() {
        let outcome = interpret_push_response("contacts", 503, "gateway busy");
        assert!(matches!(outcome, PushOutcome::Failed { status: 503, .. }));
    }

    #[test]
    fn test_unparseable_body_is_tolerated() {
        let outcome = interpret_push_response("contacts", 500, "<html>oops</html>");
        assert!(matches!(outcome, PushOutcome::Failed { status: 500, .. }));
    }

    #[test]
    fn test_delta_batch_row_count() {
        let batch: DeltaBatch = serde_json::from_str(
            r#"{"entities":{"contacts":[{"id":"c1"}],"invoices":[{"id":"i1"},{"id":"i2"}]}}"#,
        )
        .unwrap();
        assert_eq!(batch.row_count(), 3);
    }
}
