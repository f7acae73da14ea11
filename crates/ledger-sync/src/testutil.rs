//! Shared test doubles for driver and coordinator tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::remote::{DeltaBatch, PushOutcome, RemoteApi};
use ledger_core::{OutboxItem, RecordLock};

/// One recorded push for assertions.
#[derive(Debug, Clone)]
pub struct RecordedPush {
    pub entity_type: String,
    pub entity_id: String,
    pub idempotency_key: String,
}

/// Scriptable in-memory [`RemoteApi`].
///
/// Pushes return outcomes scripted per entity id (default `Accepted`);
/// pulls drain a queue of delta batches (default empty).
#[derive(Default)]
pub struct ScriptedRemote {
    /// Per-entity-id scripted outcomes. `Err` entries simulate transport
    /// failures.
    outcomes: Mutex<HashMap<String, VecDeque<Result<PushOutcome, String>>>>,

    /// Every push that reached the remote, in order.
    pub pushes: Mutex<Vec<RecordedPush>>,

    /// Queued pull results; each `pull_since` drains one.
    pulls: Mutex<VecDeque<Result<DeltaBatch, String>>>,

    /// Number of `pull_since` calls observed.
    pub pull_count: Mutex<usize>,

    /// Locks replicated to the remote.
    pub replicated_locks: Mutex<Vec<RecordLock>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next push outcome for an entity id.
    pub fn script_push(&self, entity_id: &str, outcome: PushOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(entity_id.to_string())
            .or_default()
            .push_back(Ok(outcome));
    }

    /// Scripts a transport failure for an entity id.
    pub fn script_push_error(&self, entity_id: &str, message: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(entity_id.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    /// Queues a delta batch for the next pull.
    pub fn script_pull(&self, batch: DeltaBatch) {
        self.pulls.lock().unwrap().push_back(Ok(batch));
    }

    /// Queues a delta batch from raw JSON.
    pub fn script_pull_json(&self, json: &str) {
        let batch: DeltaBatch = serde_json::from_str(json).expect("valid delta json");
        self.script_pull(batch);
    }

    /// Queues a pull failure.
    pub fn script_pull_error(&self, message: &str) {
        self.pulls.lock().unwrap().push_back(Err(message.to_string()));
    }

    /// Entity ids pushed, in order.
    pub fn pushed_entity_ids(&self) -> Vec<String> {
        self.pushes
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.entity_id.clone())
            .collect()
    }

    /// Idempotency keys seen, in order.
    pub fn idempotency_keys(&self) -> Vec<String> {
        self.pushes
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.idempotency_key.clone())
            .collect()
    }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
    async fn push(&self, item: &OutboxItem) -> SyncResult<PushOutcome> {
        self.pushes.lock().unwrap().push(RecordedPush {
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id.clone(),
            idempotency_key: item.id.clone(),
        });

        let scripted = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&item.entity_id)
            .and_then(VecDeque::pop_front);

        match scripted {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(SyncError::RequestFailed(message)),
            None => Ok(PushOutcome::Accepted),
        }
    }

    async fn pull_since(&self, _since: DateTime<Utc>) -> SyncResult<DeltaBatch> {
        *self.pull_count.lock().unwrap() += 1;
        match self.pulls.lock().unwrap().pop_front() {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(message)) => Err(SyncError::RequestFailed(message)),
            None => Ok(DeltaBatch::default()),
        }
    }

    async fn replicate_lock(&self, lock: &RecordLock) -> SyncResult<()> {
        self.replicated_locks.lock().unwrap().push(lock.clone());
        Ok(())
    }

    async fn release_lock(&self, _entity_type: &str, _entity_id: &str) -> SyncResult<()> {
        Ok(())
    }
}
