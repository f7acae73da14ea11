//! # Realtime Peer Event Handler
//!
//! Applies peer-originated create/update/delete events from the fan-out
//! channel to the local store and the observable view model, skipping
//! self-originated events and entities this user is editing.
//!
//! ## Event Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Inbound Peer Event Pipeline                          │
//! │                                                                         │
//! │  "<entity>:<created|updated|deleted>" + payload                        │
//! │       │                                                                 │
//! │       ├── 1. map event name → (entity_type, op); drop unknown          │
//! │       ├── 2. drop if event.user_id == current user (self echo)         │
//! │       ├── 3. locate payload object:                                    │
//! │       │       payload[entity] → payload[plural] → alias → payload      │
//! │       ├── 4. locate entity id:                                         │
//! │       │       payload.id → <entity>Id → <entity>_id → aliases          │
//! │       ├── 5. drop if we hold the lock (our own write echoing back)     │
//! │       ├── 6. normalize snake_case → camelCase, coerce money fields     │
//! │       ├── 7. dispatch to the view model (marked remote: the            │
//! │       │       dispatcher must not re-enter the outbox)                 │
//! │       └── 8. mirror to the local store (upsert / delete, no capture)   │
//! │                                                                         │
//! │  "lock:acquired" / "lock:released" ──► routed to the lock manager      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::PeerEvent;
use crate::error::SyncResult;
use crate::locks::LockManager;
use ledger_db::Database;

// =============================================================================
// Operations
// =============================================================================

/// Peer mutation kind carried by an event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Created,
    Updated,
    Deleted,
}

impl std::fmt::Display for RemoteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteOp::Created => write!(f, "created"),
            RemoteOp::Updated => write!(f, "updated"),
            RemoteOp::Deleted => write!(f, "deleted"),
        }
    }
}

/// What the handler did with an event (observable for tests and metrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    Dropped,
}

// =============================================================================
// View Dispatcher
// =============================================================================

/// Applies a normalized remote mutation to the observable in-memory view
/// model. Implementations receive camelCase payloads and MUST treat them
/// as remote: they never re-enter the outbox.
pub trait ViewDispatcher: Send + Sync {
    fn dispatch(&self, entity_type: &str, op: RemoteOp, payload: &Value);
}

/// No-op dispatcher for headless use and tests.
pub struct NoOpDispatcher;

impl ViewDispatcher for NoOpDispatcher {
    fn dispatch(&self, _entity_type: &str, _op: RemoteOp, _payload: &Value) {}
}

// =============================================================================
// Event Name Mapping
// =============================================================================

/// Singular event names whose payload container uses a different word.
const PAYLOAD_ALIASES: &[(&str, &str)] = &[("rental_agreement", "agreement")];

/// Generic id-field aliases tried after the entity-derived spellings.
const ID_ALIASES: &[&str] = &["agreementId"];

/// Splits `"<entity>:<op>"`; `None` for unknown ops or malformed names.
pub fn parse_event_name(event: &str) -> Option<(&str, RemoteOp)> {
    let (entity, op) = event.split_once(':')?;
    if entity.is_empty() {
        return None;
    }
    let op = match op {
        "created" => RemoteOp::Created,
        "updated" => RemoteOp::Updated,
        "deleted" => RemoteOp::Deleted,
        _ => return None,
    };
    Some((entity, op))
}

/// Maps a singular event entity to its snake_case entity type
/// ("transaction" → "transactions", "property" → "properties").
pub fn pluralize(singular: &str) -> String {
    if let Some(stem) = singular.strip_suffix('y') {
        format!("{stem}ies")
    } else if singular.ends_with('s') {
        format!("{singular}es")
    } else {
        format!("{singular}s")
    }
}

/// snake_case → camelCase.
pub fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Locates the entity object inside an event payload.
fn locate_payload<'a>(entity: &str, payload: &'a Value) -> &'a Value {
    if let Some(inner) = payload.get(entity) {
        return inner;
    }
    if let Some(inner) = payload.get(pluralize(entity)) {
        return inner;
    }
    for (name, alias) in PAYLOAD_ALIASES {
        if *name == entity {
            if let Some(inner) = payload.get(*alias) {
                return inner;
            }
        }
    }
    payload
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Locates the entity id. Deleted events often carry only an id field
/// named after the entity, so those spellings are tried as fallbacks.
fn locate_entity_id(entity: &str, op: RemoteOp, payload: &Value) -> Option<String> {
    if let Some(id) = payload.get("id").and_then(value_to_id) {
        return Some(id);
    }
    if op != RemoteOp::Deleted {
        return None;
    }

    let camel = format!("{}Id", camel_case(entity));
    let snake = format!("{entity}_id");
    for key in [camel.as_str(), snake.as_str()] {
        if let Some(id) = payload.get(key).and_then(value_to_id) {
            return Some(id);
        }
    }
    for alias in ID_ALIASES {
        if let Some(id) = payload.get(*alias).and_then(value_to_id) {
            return Some(id);
        }
    }
    None
}

// =============================================================================
// Normalization
// =============================================================================

/// Snake_case fields coerced to numbers when they arrive as strings
/// (several backends serialize decimals as strings).
const MONEY_FIELDS: &[&str] = &[
    "amount", "balance", "total", "subtotal", "rate", "price", "tax", "discount", "quantity",
];

const MONEY_SUFFIXES: &[&str] = &[
    "_amount",
    "_total",
    "_balance",
    "_rate",
    "_price",
    "_percent",
    "_percentage",
    "_fee",
    "_cost",
];

fn is_money_field(snake_key: &str) -> bool {
    MONEY_FIELDS.contains(&snake_key)
        || MONEY_SUFFIXES.iter().any(|suffix| snake_key.ends_with(suffix))
}

fn coerce_number(value: &Value) -> Value {
    match value {
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(n) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or_else(|| value.clone()),
            Err(_) => value.clone(),
        },
        other => other.clone(),
    }
}

/// Renames one key for the local view, applying per-entity legacy
/// mappings before the generic camelCase conversion.
fn view_key(entity_type: &str, snake_key: &str) -> String {
    if entity_type == "rental_agreements" {
        // Legacy schema: the agreement's "tenant" is the renting contact,
        // while org_id carries the actual tenant scope.
        match snake_key {
            "tenant_id" | "tenantId" => return "contactId".to_string(),
            "org_id" => return "orgId".to_string(),
            _ => {}
        }
    }
    camel_case(snake_key)
}

/// Normalizes a remote snake_case row into the local camelCase view
/// shape, coercing known money/percent fields to numbers.
pub fn normalize_payload(entity_type: &str, row: &Value) -> Value {
    let Some(object) = row.as_object() else {
        return row.clone();
    };

    let mut out = Map::with_capacity(object.len());
    for (key, value) in object {
        let coerced = if is_money_field(key) {
            coerce_number(value)
        } else {
            value.clone()
        };
        out.insert(view_key(entity_type, key), coerced);
    }
    Value::Object(out)
}

// =============================================================================
// Realtime Handler
// =============================================================================

/// Consumes peer events and applies them to view model and local store.
pub struct RealtimeHandler {
    /// Local store (mirror writes; never captures to the outbox).
    db: Database,

    /// Lock manager: receives lock events, answers ownership checks.
    locks: Arc<LockManager>,

    /// View model sink.
    dispatcher: Arc<dyn ViewDispatcher>,

    /// Current user; events carrying this id are self echoes.
    user_id: String,

    /// Inbound events from the channel client.
    incoming_rx: mpsc::Receiver<PeerEvent>,

    /// Shutdown receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for controlling the realtime handler.
#[derive(Clone)]
pub struct RealtimeHandlerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl RealtimeHandlerHandle {
    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

impl RealtimeHandler {
    /// Creates a handler consuming events from `incoming_rx`.
    pub fn new(
        db: Database,
        locks: Arc<LockManager>,
        dispatcher: Arc<dyn ViewDispatcher>,
        user_id: impl Into<String>,
        incoming_rx: mpsc::Receiver<PeerEvent>,
    ) -> (Self, RealtimeHandlerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let handler = RealtimeHandler {
            db,
            locks,
            dispatcher,
            user_id: user_id.into(),
            incoming_rx,
            shutdown_rx,
        };

        (handler, RealtimeHandlerHandle { shutdown_tx })
    }

    /// Runs the handler loop. Spawn as a background task.
    pub async fn run(mut self) {
        info!("Realtime handler starting");

        loop {
            tokio::select! {
                Some(event) = self.incoming_rx.recv() => {
                    if let Err(e) = self.handle_event(&event).await {
                        error!(?e, event = %event.event, "Failed to handle peer event");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Realtime handler shutting down");
                    break;
                }
            }
        }

        info!("Realtime handler stopped");
    }

    /// Processes one peer event.
    pub async fn handle_event(&self, event: &PeerEvent) -> SyncResult<EventOutcome> {
        // Lock events go to the lock manager.
        if event.event.starts_with("lock:") {
            self.locks.handle_peer_event(event).await?;
            return Ok(EventOutcome::Applied);
        }

        let Some((entity, op)) = parse_event_name(&event.event) else {
            debug!(event = %event.event, "Unknown event, dropping");
            return Ok(EventOutcome::Dropped);
        };
        let entity_type = pluralize(entity);

        // Self-echo suppression: our own mutation broadcast back to us.
        if event.user_id.as_deref() == Some(self.user_id.as_str()) {
            debug!(event = %event.event, "Dropping self-originated event");
            return Ok(EventOutcome::Dropped);
        }

        let object = locate_payload(entity, &event.payload);
        let Some(entity_id) = locate_entity_id(entity, op, object) else {
            warn!(event = %event.event, "Peer event has no entity id, dropping");
            return Ok(EventOutcome::Dropped);
        };

        // Ownership suppression: we hold the lock, so we are the writer
        // and this broadcast is an echo of our own edit session.
        if self.locks.is_owner(&entity_type, &entity_id, &self.user_id).await {
            debug!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                "Holding lock on entity, dropping peer event"
            );
            return Ok(EventOutcome::Dropped);
        }

        // View model first (normalized), then the store mirror (raw
        // snake_case form, keyed by id).
        let normalized = normalize_payload(&entity_type, object);
        self.dispatcher.dispatch(&entity_type, op, &normalized);

        let entities = self.db.entities();
        entities.ensure_tables(&[entity_type.as_str()]).await?;

        match op {
            RemoteOp::Created | RemoteOp::Updated => {
                let mut row = object.clone();
                if row.get("id").is_none() {
                    if let Some(map) = row.as_object_mut() {
                        map.insert("id".to_string(), Value::String(entity_id.clone()));
                    }
                }
                entities.upsert(&entity_type, &row).await?;
            }
            RemoteOp::Deleted => {
                entities.delete(&entity_type, &entity_id).await?;
            }
        }

        debug!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            op = %op,
            "Applied peer event"
        );
        Ok(EventOutcome::Applied)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedRemote;
    use chrono::{Duration as ChronoDuration, Utc};
    use ledger_db::{Database, DbConfig};
    use serde_json::json;
    use std::sync::Mutex;

    /// Dispatcher that records every call.
    #[derive(Default)]
    struct RecordingDispatcher {
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl ViewDispatcher for RecordingDispatcher {
        fn dispatch(&self, entity_type: &str, _op: RemoteOp, payload: &Value) {
            self.calls
                .lock()
                .unwrap()
                .push((entity_type.to_string(), payload.clone()));
        }
    }

    async fn handler() -> (Database, Arc<LockManager>, Arc<RecordingDispatcher>, RealtimeHandler) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let locks = Arc::new(LockManager::new(
            db.locks(),
            Arc::new(ScriptedRemote::new()),
            None,
            ChronoDuration::minutes(5),
        ));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let (_tx, rx) = mpsc::channel(4);
        let (h, _handle) = RealtimeHandler::new(
            db.clone(),
            locks.clone(),
            dispatcher.clone(),
            "u1",
            rx,
        );
        (db, locks, dispatcher, h)
    }

    fn event(name: &str, payload: Value, user: &str) -> PeerEvent {
        PeerEvent {
            event: name.into(),
            payload,
            user_id: Some(user.into()),
            timestamp: Some(Utc::now()),
        }
    }

    // -------------------------------------------------------------------------
    // Pure helpers
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_event_name() {
        assert_eq!(
            parse_event_name("transaction:created"),
            Some(("transaction", RemoteOp::Created))
        );
        assert_eq!(
            parse_event_name("rental_agreement:deleted"),
            Some(("rental_agreement", RemoteOp::Deleted))
        );
        assert_eq!(parse_event_name("transaction:renamed"), None);
        assert_eq!(parse_event_name("no-colon"), None);
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("transaction"), "transactions");
        assert_eq!(pluralize("property"), "properties");
        assert_eq!(pluralize("plan_amenity"), "plan_amenities");
        assert_eq!(pluralize("rental_agreement"), "rental_agreements");
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("contact_id"), "contactId");
        assert_eq!(camel_case("rental_agreement"), "rentalAgreement");
        assert_eq!(camel_case("amount"), "amount");
    }

    #[test]
    fn test_normalize_converts_and_coerces() {
        let normalized = normalize_payload(
            "invoices",
            &json!({
                "id": "i1",
                "contact_id": "c1",
                "total_amount": "149.50",
                "tax_rate": "5",
                "memo": "unchanged"
            }),
        );
        assert_eq!(normalized["id"], "i1");
        assert_eq!(normalized["contactId"], "c1");
        assert_eq!(normalized["totalAmount"], json!(149.5));
        assert_eq!(normalized["taxRate"], json!(5.0));
        assert_eq!(normalized["memo"], "unchanged");
    }

    #[test]
    fn test_normalize_rental_agreement_aliases() {
        let normalized = normalize_payload(
            "rental_agreements",
            &json!({"id": "r1", "tenant_id": "contact-9", "org_id": "T", "unit_id": "u-2"}),
        );
        // Legacy mapping: the agreement's "tenant" is the renting contact.
        assert_eq!(normalized["contactId"], "contact-9");
        assert_eq!(normalized["orgId"], "T");
        assert_eq!(normalized["unitId"], "u-2");
    }

    // -------------------------------------------------------------------------
    // Handler behavior
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_self_echo_is_dropped() {
        let (db, _locks, dispatcher, handler) = handler().await;

        let outcome = handler
            .handle_event(&event(
                "transaction:created",
                json!({"transaction": {"id": "t1", "tenant_id": "T"}}),
                "u1", // same as handler's user
            ))
            .await
            .unwrap();

        assert_eq!(outcome, EventOutcome::Dropped);
        assert!(dispatcher.calls.lock().unwrap().is_empty());
        // No store write either.
        db.entities().ensure_tables(&["transactions"]).await.unwrap();
        assert!(db.entities().get("transactions", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_create_is_dispatched_and_mirrored() {
        let (db, _locks, dispatcher, handler) = handler().await;

        let outcome = handler
            .handle_event(&event(
                "transaction:created",
                json!({"transaction": {"id": "t1", "tenant_id": "T", "amount": "25.00"}}),
                "u2",
            ))
            .await
            .unwrap();

        assert_eq!(outcome, EventOutcome::Applied);

        // Dispatched normalized.
        let calls = dispatcher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "transactions");
        assert_eq!(calls[0].1["amount"], json!(25.0));
        drop(calls);

        // Mirrored raw to the store, and never captured to the outbox.
        let stored = db.entities().get("transactions", "t1").await.unwrap().unwrap();
        assert_eq!(stored["amount"], "25.00");
        assert_eq!(db.outbox().pending_count("T").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_locked_entity_suppresses_event() {
        let (db, locks, dispatcher, handler) = handler().await;
        db.entities().ensure_tables(&["invoices"]).await.unwrap();

        // We hold the lock: the broadcast is our own edit echoing back.
        locks.acquire("invoices", "i1", "u1", None, None).await.unwrap();

        let outcome = handler
            .handle_event(&event(
                "invoice:updated",
                json!({"invoice": {"id": "i1", "status": "sent"}}),
                "u2",
            ))
            .await
            .unwrap();

        assert_eq!(outcome, EventOutcome::Dropped);
        assert!(dispatcher.calls.lock().unwrap().is_empty());
        assert!(db.entities().get("invoices", "i1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_event_with_fallback_id_key() {
        let (db, _locks, _dispatcher, handler) = handler().await;
        db.entities().ensure_tables(&["transactions"]).await.unwrap();
        db.entities()
            .upsert("transactions", &json!({"id": "t1", "tenant_id": "T"}))
            .await
            .unwrap();

        let outcome = handler
            .handle_event(&event(
                "transaction:deleted",
                json!({"transactionId": "t1"}),
                "u2",
            ))
            .await
            .unwrap();

        assert_eq!(outcome, EventOutcome::Applied);
        assert!(db.entities().get("transactions", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_event_and_missing_id_are_dropped() {
        let (_db, _locks, dispatcher, handler) = handler().await;

        let outcome = handler
            .handle_event(&event("transaction:archived", json!({}), "u2"))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Dropped);

        let outcome = handler
            .handle_event(&event("transaction:created", json!({"transaction": {}}), "u2"))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Dropped);

        assert!(dispatcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_events_route_to_lock_manager() {
        let (_db, locks, _dispatcher, handler) = handler().await;

        let acquired = event(
            "lock:acquired",
            json!({
                "entity": "invoices",
                "entity_id": "i1",
                "user_id": "u2",
                "locked_at": ledger_core::ids::to_iso(ledger_core::ids::now()),
                "expires_at": ledger_core::ids::to_iso(ledger_core::ids::now() + ChronoDuration::minutes(5)),
            }),
            "u2",
        );
        handler.handle_event(&acquired).await.unwrap();
        assert_eq!(locks.owner("invoices", "i1").await.as_deref(), Some("u2"));
    }
}
