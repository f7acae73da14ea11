//! # Record Lock Manager
//!
//! Short-TTL cooperative locks on `(entity_type, entity_id)`, shared with
//! peers via the realtime channel so two users do not silently overwrite
//! each other. Advisory, not mandatory.
//!
//! ## Lock Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Cooperative Lock Lifecycle                         │
//! │                                                                         │
//! │  acquire(e, id, user)                                                  │
//! │       │                                                                 │
//! │       ├── held by same user (valid) ──► extend: expires = now + TTL    │
//! │       ├── held by other user (valid) ─► false (defer/skip edit)        │
//! │       └── absent or expired ─────────► create, persist,                │
//! │                                        best-effort: replicate to       │
//! │                                        remote + broadcast on channel   │
//! │                                                                         │
//! │  release(e, id, user)   only the holder may release                    │
//! │  get(e, id)             expired locks transparently dropped on read    │
//! │  sweep (every minute)   purge expired entries, persist                 │
//! │                                                                         │
//! │  INBOUND EVENTS                                                        │
//! │  lock:acquired  overwrite local only if inbound locked_at is newer     │
//! │  lock:released  delete by key                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager's in-memory map is the single writer of `record_locks`;
//! it reloads on startup, discarding expired entries.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandle, PeerEvent};
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteApi;
use ledger_core::ids::{now, parse_iso, to_iso};
use ledger_core::{lock_key, RecordLock};
use ledger_db::LockRepository;

// =============================================================================
// Wire Shape
// =============================================================================

/// Lock payload as it travels on the channel and to the lock endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockWire {
    #[serde(alias = "entity_type")]
    entity: String,
    entity_id: String,
    user_id: String,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
    locked_at: String,
    expires_at: String,
}

impl LockWire {
    fn from_lock(lock: &RecordLock) -> Self {
        LockWire {
            entity: lock.entity_type.clone(),
            entity_id: lock.entity_id.clone(),
            user_id: lock.user_id.clone(),
            user_name: lock.user_name.clone(),
            tenant_id: lock.tenant_id.clone(),
            locked_at: to_iso(lock.locked_at),
            expires_at: to_iso(lock.expires_at),
        }
    }

    fn into_lock(self) -> SyncResult<RecordLock> {
        let locked_at = parse_iso(&self.locked_at)
            .ok_or_else(|| SyncError::InvalidEvent(format!("bad locked_at: {}", self.locked_at)))?;
        let expires_at = parse_iso(&self.expires_at).ok_or_else(|| {
            SyncError::InvalidEvent(format!("bad expires_at: {}", self.expires_at))
        })?;

        Ok(RecordLock {
            entity_type: self.entity,
            entity_id: self.entity_id,
            user_id: self.user_id,
            user_name: self.user_name,
            tenant_id: self.tenant_id,
            locked_at,
            expires_at,
        })
    }
}

/// Key-only payload for release events.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockKeyWire {
    #[serde(alias = "entity_type")]
    entity: String,
    entity_id: String,
}

// =============================================================================
// Lock Manager
// =============================================================================

/// Cooperative record lock manager.
pub struct LockManager {
    /// In-memory map, keyed `"<entity_type>:<entity_id>"`. Single writer
    /// of the `record_locks` table.
    locks: RwLock<HashMap<String, RecordLock>>,

    /// Persistence.
    repo: LockRepository,

    /// Best-effort remote replication.
    remote: Arc<dyn RemoteApi>,

    /// Best-effort peer fan-out; `None` runs local-only.
    channel: Option<ChannelHandle>,

    /// Lock time-to-live.
    ttl: ChronoDuration,
}

impl LockManager {
    /// Creates a lock manager. Call [`LockManager::load`] before use to
    /// restore persisted locks.
    pub fn new(
        repo: LockRepository,
        remote: Arc<dyn RemoteApi>,
        channel: Option<ChannelHandle>,
        ttl: ChronoDuration,
    ) -> Self {
        LockManager {
            locks: RwLock::new(HashMap::new()),
            repo,
            remote,
            channel,
            ttl,
        }
    }

    /// Reloads persisted locks, discarding expired entries.
    pub async fn load(&self) -> SyncResult<()> {
        let at = now();
        let stored = self.repo.load_all().await?;
        let total = stored.len();

        let mut map = self.locks.write().await;
        map.clear();
        for lock in stored {
            if !lock.is_expired_at(at) {
                map.insert(lock.key(), lock);
            }
        }
        let live = map.len();
        drop(map);

        let purged = self.repo.delete_expired(at).await?;
        info!(live, expired = total - live, purged, "Record locks reloaded");
        Ok(())
    }

    // =========================================================================
    // Core Operations
    // =========================================================================

    /// Tries to take (or extend) the lock on `(entity_type, entity_id)`.
    ///
    /// Returns false when another user holds a valid lock. On success the
    /// lock is persisted and replicated best-effort: remote or channel
    /// failures never fail the acquire.
    pub async fn acquire(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
        user_name: Option<&str>,
        tenant_id: Option<&str>,
    ) -> SyncResult<bool> {
        let key = lock_key(entity_type, entity_id);
        let at = now();

        let lock = {
            let mut map = self.locks.write().await;

            match map.get(&key) {
                Some(existing) if !existing.is_expired_at(at) => {
                    if existing.user_id != user_id {
                        debug!(
                            key = %key,
                            holder = %existing.user_id,
                            "Lock held by another user"
                        );
                        return Ok(false);
                    }
                    // Same user: extend.
                    let mut extended = existing.clone();
                    extended.expires_at = at + self.ttl;
                    map.insert(key.clone(), extended.clone());
                    extended
                }
                _ => {
                    let fresh = RecordLock {
                        entity_type: entity_type.to_string(),
                        entity_id: entity_id.to_string(),
                        user_id: user_id.to_string(),
                        user_name: user_name.map(str::to_string),
                        tenant_id: tenant_id.map(str::to_string),
                        locked_at: at,
                        expires_at: at + self.ttl,
                    };
                    map.insert(key.clone(), fresh.clone());
                    fresh
                }
            }
        };

        if let Err(e) = self.repo.save(&lock).await {
            warn!(?e, key = %key, "Failed to persist lock (kept in memory)");
        }

        if let Err(e) = self.remote.replicate_lock(&lock).await {
            debug!(?e, key = %key, "Lock replication failed (best-effort)");
        }
        self.broadcast_acquired(&lock).await;

        Ok(true)
    }

    /// Releases a lock. Only the holder may release.
    pub async fn release(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
    ) -> SyncResult<()> {
        let key = lock_key(entity_type, entity_id);
        let at = now();

        {
            let mut map = self.locks.write().await;
            match map.get(&key) {
                None => return Ok(()), // nothing to release
                Some(existing) if existing.is_expired_at(at) => {
                    map.remove(&key);
                }
                Some(existing) if existing.user_id != user_id => {
                    return Err(SyncError::NotLockOwner { key });
                }
                Some(_) => {
                    map.remove(&key);
                }
            }
        }

        if let Err(e) = self.repo.delete(&key).await {
            warn!(?e, key = %key, "Failed to delete persisted lock");
        }

        if let Err(e) = self.remote.release_lock(entity_type, entity_id).await {
            debug!(?e, key = %key, "Remote lock release failed (best-effort)");
        }
        self.broadcast_released(entity_type, entity_id, user_id).await;

        Ok(())
    }

    /// Returns the lock on an entity, transparently dropping it when
    /// expired.
    pub async fn get(&self, entity_type: &str, entity_id: &str) -> Option<RecordLock> {
        let key = lock_key(entity_type, entity_id);
        let at = now();

        let mut map = self.locks.write().await;
        match map.get(&key) {
            Some(lock) if lock.is_expired_at(at) => {
                map.remove(&key);
                None
            }
            Some(lock) => Some(lock.clone()),
            None => None,
        }
    }

    /// Whether `user_id` holds a valid lock on the entity.
    pub async fn is_owner(&self, entity_type: &str, entity_id: &str, user_id: &str) -> bool {
        self.get(entity_type, entity_id)
            .await
            .map(|lock| lock.user_id == user_id)
            .unwrap_or(false)
    }

    /// The current holder's user ID, if a valid lock exists.
    pub async fn owner(&self, entity_type: &str, entity_id: &str) -> Option<String> {
        self.get(entity_type, entity_id).await.map(|lock| lock.user_id)
    }

    /// Whether someone other than `user_id` holds a valid lock. Drives
    /// the upstream driver's push deferral.
    pub async fn is_locked_by_other(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
    ) -> bool {
        self.get(entity_type, entity_id)
            .await
            .map(|lock| lock.user_id != user_id)
            .unwrap_or(false)
    }

    // =========================================================================
    // Inbound Peer Events
    // =========================================================================

    /// Applies a `lock:acquired` / `lock:released` event from a peer.
    pub async fn handle_peer_event(&self, event: &PeerEvent) -> SyncResult<()> {
        match event.event.as_str() {
            "lock:acquired" => {
                let wire: LockWire = serde_json::from_value(event.payload.clone())
                    .map_err(|e| SyncError::InvalidEvent(e.to_string()))?;
                let inbound = wire.into_lock()?;
                let key = inbound.key();

                let mut map = self.locks.write().await;
                let stale = map
                    .get(&key)
                    .map(|existing| inbound.locked_at <= existing.locked_at)
                    .unwrap_or(false);
                if stale {
                    debug!(key = %key, "Ignoring stale peer lock");
                    return Ok(());
                }
                map.insert(key.clone(), inbound.clone());
                drop(map);

                if let Err(e) = self.repo.save(&inbound).await {
                    warn!(?e, key = %key, "Failed to persist peer lock");
                }
                Ok(())
            }
            "lock:released" => {
                let wire: LockKeyWire = serde_json::from_value(event.payload.clone())
                    .map_err(|e| SyncError::InvalidEvent(e.to_string()))?;
                let key = lock_key(&wire.entity, &wire.entity_id);

                self.locks.write().await.remove(&key);
                if let Err(e) = self.repo.delete(&key).await {
                    warn!(?e, key = %key, "Failed to delete peer-released lock");
                }
                Ok(())
            }
            other => Err(SyncError::InvalidEvent(format!(
                "not a lock event: {other}"
            ))),
        }
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Purges expired entries from memory and the store. Returns how many
    /// in-memory entries were dropped.
    pub async fn sweep(&self) -> usize {
        let at = now();
        let dropped = {
            let mut map = self.locks.write().await;
            let before = map.len();
            map.retain(|_, lock| !lock.is_expired_at(at));
            before - map.len()
        };

        if let Err(e) = self.repo.delete_expired(at).await {
            warn!(?e, "Failed to purge expired locks from store");
        }

        if dropped > 0 {
            debug!(dropped, "Swept expired locks");
        }
        dropped
    }

    /// Spawns the background sweep task.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Lock sweeper shutting down");
                        break;
                    }
                }
            }
        });

        SweeperHandle { shutdown_tx }
    }

    // =========================================================================
    // Broadcast Helpers
    // =========================================================================

    async fn broadcast_acquired(&self, lock: &RecordLock) {
        let Some(channel) = &self.channel else { return };
        let payload = match serde_json::to_value(LockWire::from_lock(lock)) {
            Ok(value) => value,
            Err(e) => {
                warn!(?e, "Failed to encode lock broadcast");
                return;
            }
        };
        let event = PeerEvent::outbound("lock:acquired", payload, &lock.user_id);
        if let Err(e) = channel.publish(event).await {
            debug!(?e, "Lock acquire broadcast failed (best-effort)");
        }
    }

    async fn broadcast_released(&self, entity_type: &str, entity_id: &str, user_id: &str) {
        let Some(channel) = &self.channel else { return };
        let payload = serde_json::json!({
            "entity": entity_type,
            "entity_id": entity_id,
        });
        let event = PeerEvent::outbound("lock:released", payload, user_id);
        if let Err(e) = channel.publish(event).await {
            debug!(?e, "Lock release broadcast failed (best-effort)");
        }
    }
}

// =============================================================================
// Sweeper Handle
// =============================================================================

/// Handle for stopping the background sweep task.
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SweeperHandle {
    /// Triggers graceful shutdown of the sweeper.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedRemote;
    use ledger_db::{Database, DbConfig};
    use serde_json::json;

    async fn manager_with_ttl(ttl: ChronoDuration) -> (Database, Arc<LockManager>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let manager = Arc::new(LockManager::new(
            db.locks(),
            Arc::new(ScriptedRemote::new()),
            None,
            ttl,
        ));
        (db, manager)
    }

    #[tokio::test]
    async fn test_acquire_then_other_user_denied() {
        let (_db, locks) = manager_with_ttl(ChronoDuration::minutes(5)).await;

        assert!(locks.acquire("invoices", "i1", "u1", Some("Asha"), Some("T")).await.unwrap());
        assert!(!locks.acquire("invoices", "i1", "u2", None, Some("T")).await.unwrap());

        assert_eq!(locks.owner("invoices", "i1").await.as_deref(), Some("u1"));
        assert!(locks.is_owner("invoices", "i1", "u1").await);
        assert!(locks.is_locked_by_other("invoices", "i1", "u2").await);
        assert!(!locks.is_locked_by_other("invoices", "i1", "u1").await);
    }

    #[tokio::test]
    async fn test_holder_extends_lock() {
        let (_db, locks) = manager_with_ttl(ChronoDuration::minutes(5)).await;

        assert!(locks.acquire("invoices", "i1", "u1", None, None).await.unwrap());
        let first = locks.get("invoices", "i1").await.unwrap();

        assert!(locks.acquire("invoices", "i1", "u1", None, None).await.unwrap());
        let extended = locks.get("invoices", "i1").await.unwrap();

        assert!(extended.expires_at > first.expires_at);
        // locked_at survives extension.
        assert_eq!(
            extended.locked_at.timestamp_millis(),
            first.locked_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_expired_lock_is_dropped_and_reacquirable() {
        let (_db, locks) = manager_with_ttl(ChronoDuration::milliseconds(10)).await;

        assert!(locks.acquire("invoices", "i1", "u1", None, None).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Transparent drop on read.
        assert!(locks.get("invoices", "i1").await.is_none());
        // Anyone may acquire after expiry.
        assert!(locks.acquire("invoices", "i1", "u2", None, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_only_holder_may_release() {
        let (_db, locks) = manager_with_ttl(ChronoDuration::minutes(5)).await;

        locks.acquire("invoices", "i1", "u1", None, None).await.unwrap();

        let err = locks.release("invoices", "i1", "u2").await.unwrap_err();
        assert!(matches!(err, SyncError::NotLockOwner { .. }));

        locks.release("invoices", "i1", "u1").await.unwrap();
        assert!(locks.get("invoices", "i1").await.is_none());

        // Releasing an absent lock is a no-op.
        locks.release("invoices", "i1", "u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_locks_survive_restart_via_store() {
        let (db, locks) = manager_with_ttl(ChronoDuration::minutes(5)).await;
        locks.acquire("invoices", "i1", "u1", None, Some("T")).await.unwrap();

        // A second manager over the same store sees the lock after load.
        let reloaded = LockManager::new(
            db.locks(),
            Arc::new(ScriptedRemote::new()),
            None,
            ChronoDuration::minutes(5),
        );
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.owner("invoices", "i1").await.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_peer_acquired_overwrites_only_if_newer() {
        let (_db, locks) = manager_with_ttl(ChronoDuration::minutes(5)).await;

        locks.acquire("invoices", "i1", "u1", None, None).await.unwrap();
        let local = locks.get("invoices", "i1").await.unwrap();

        // Older peer lock is ignored.
        let stale = PeerEvent {
            event: "lock:acquired".into(),
            payload: json!({
                "entity": "invoices",
                "entity_id": "i1",
                "user_id": "u2",
                "locked_at": to_iso(local.locked_at - ChronoDuration::minutes(1)),
                "expires_at": to_iso(local.expires_at),
            }),
            user_id: Some("u2".into()),
            timestamp: None,
        };
        locks.handle_peer_event(&stale).await.unwrap();
        assert_eq!(locks.owner("invoices", "i1").await.as_deref(), Some("u1"));

        // Newer peer lock wins.
        let fresh = PeerEvent {
            event: "lock:acquired".into(),
            payload: json!({
                "entity": "invoices",
                "entity_id": "i1",
                "user_id": "u2",
                "locked_at": to_iso(local.locked_at + ChronoDuration::minutes(1)),
                "expires_at": to_iso(local.expires_at + ChronoDuration::minutes(1)),
            }),
            user_id: Some("u2".into()),
            timestamp: None,
        };
        locks.handle_peer_event(&fresh).await.unwrap();
        assert_eq!(locks.owner("invoices", "i1").await.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn test_peer_release_deletes_by_key() {
        let (_db, locks) = manager_with_ttl(ChronoDuration::minutes(5)).await;
        locks.acquire("invoices", "i1", "u1", None, None).await.unwrap();

        let release = PeerEvent {
            event: "lock:released".into(),
            payload: json!({"entity": "invoices", "entity_id": "i1"}),
            user_id: Some("u2".into()),
            timestamp: None,
        };
        locks.handle_peer_event(&release).await.unwrap();
        assert!(locks.get("invoices", "i1").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_purges_expired() {
        let (db, locks) = manager_with_ttl(ChronoDuration::milliseconds(10)).await;
        locks.acquire("invoices", "i1", "u1", None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let dropped = locks.sweep().await;
        assert_eq!(dropped, 1);
        assert!(db.locks().load_all().await.unwrap().is_empty());
    }
}
