//! # Connection Monitor
//!
//! Tracks online/offline state and broadcasts transitions. The host
//! shell feeds it (OS network events, HTTP probe results, a manual
//! toggle); the coordinator subscribes and triggers a sync on the
//! offline→online edge.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

// =============================================================================
// Connection Monitor
// =============================================================================

/// Shared online/offline state with transition broadcast.
///
/// Clones share state; any clone may report transitions.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectionMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        ConnectionMonitor { tx: Arc::new(tx) }
    }

    /// Current state.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Reports a state change. No-op (and no broadcast) when unchanged.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connection state changed");
        }
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        ConnectionMonitor::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_observable() {
        let monitor = ConnectionMonitor::new(false);
        let mut rx = monitor.subscribe();
        assert!(!monitor.is_online());

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_unchanged_state_does_not_broadcast() {
        let monitor = ConnectionMonitor::new(true);
        let mut rx = monitor.subscribe();
        rx.borrow_and_update();

        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_clones_share_state() {
        let monitor = ConnectionMonitor::new(false);
        let clone = monitor.clone();
        clone.set_online(true);
        assert!(monitor.is_online());
    }
}
