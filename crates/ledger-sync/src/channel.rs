//! # Realtime Channel Client
//!
//! WebSocket client for the per-tenant fan-out channel, with automatic
//! reconnection and backoff. Peer create/update/delete events and lock
//! events arrive here; lock broadcasts go out here.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Channel Connection States                            │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    success   │   failure                       │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │                   │
//! │        │              │ (join room)│  └─────┬──────┘                   │
//! │        │              └─────┬──────┘        │  timer expired            │
//! │        │                    │               ▼                           │
//! │        │                    └────────► Reconnecting ────┐              │
//! │        └────────────────────────────────────────────────┘              │
//! │                                                                         │
//! │  On every (re)connect the client sends a join message for the          │
//! │  tenant room, so the server scopes fan-out to the active tenant.       │
//! │                                                                         │
//! │  Outbound publishes while disconnected are DROPPED with a warning:     │
//! │  lock replication is best-effort and stale broadcasts are worse        │
//! │  than none.                                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::RealtimeSettings;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Peer Event Envelope
// =============================================================================

/// One message on the fan-out channel.
///
/// `event` is `"<entity>:<created|updated|deleted>"` for entity events,
/// `"lock:acquired"` / `"lock:released"` for lock events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEvent {
    /// Event name, e.g. `"transaction:created"`.
    pub event: String,

    /// Event payload; shape depends on the event.
    #[serde(default)]
    pub payload: Value,

    /// Originating user, when the publisher knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Publisher timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl PeerEvent {
    /// Builds an outbound event stamped with the publishing user.
    pub fn outbound(event: impl Into<String>, payload: Value, user_id: &str) -> Self {
        PeerEvent {
            event: event.into(),
            payload,
            user_id: Some(user_id.to_string()),
            timestamp: Some(Utc::now()),
        }
    }

    fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(SyncError::from)
    }

    fn from_json(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::InvalidEvent(e.to_string()))
    }
}

// =============================================================================
// Channel State
// =============================================================================

/// Connection state for the channel client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    Reconnecting,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Backoff => write!(f, "backoff"),
            ChannelState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Channel Configuration
// =============================================================================

/// Configuration for the channel client.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket URL.
    pub url: String,

    /// Tenant room to join on connect.
    pub room: String,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Ping interval for keepalive.
    pub ping_interval: Duration,
}

impl ChannelConfig {
    /// Builds a channel config from settings and the tenant room.
    pub fn from_settings(settings: &RealtimeSettings, tenant_id: &str) -> Self {
        ChannelConfig {
            url: settings.url.clone(),
            room: tenant_id.to_string(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
            ping_interval: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Channel Handle
// =============================================================================

/// Handle for publishing events and controlling the channel client.
#[derive(Clone)]
pub struct ChannelHandle {
    outgoing_tx: mpsc::Sender<PeerEvent>,
    state: Arc<RwLock<ChannelState>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl ChannelHandle {
    /// Publishes an event to the tenant room. Best-effort: while the
    /// channel is disconnected the event is dropped with a warning.
    pub async fn publish(&self, event: PeerEvent) -> SyncResult<()> {
        if *self.state.read().await != ChannelState::Connected {
            warn!(event = %event.event, "Channel disconnected, dropping outbound event");
            return Ok(());
        }
        self.outgoing_tx
            .send(event)
            .await
            .map_err(|_| SyncError::ChannelError("Channel task gone".into()))
    }

    /// Returns the current connection state.
    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    /// Returns true if currently connected.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ChannelState::Connected
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Failed to send shutdown signal".into()))
    }
}

// =============================================================================
// Channel Client
// =============================================================================

/// WebSocket channel client with automatic reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let config = ChannelConfig::from_settings(&settings, "tenant-1");
/// let (handle, mut incoming_rx) = ChannelClient::spawn(config);
///
/// while let Some(event) = incoming_rx.recv().await {
///     println!("peer event: {}", event.event);
/// }
/// ```
pub struct ChannelClient {
    config: ChannelConfig,
    state: Arc<RwLock<ChannelState>>,
    outgoing_rx: mpsc::Receiver<PeerEvent>,
    incoming_tx: mpsc::Sender<PeerEvent>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl ChannelClient {
    /// Creates a new channel client and spawns its background task.
    ///
    /// Returns a handle for publishing and a receiver for inbound events.
    pub fn spawn(config: ChannelConfig) -> (ChannelHandle, mpsc::Receiver<PeerEvent>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<PeerEvent>(100);
        let (incoming_tx, incoming_rx) = mpsc::channel::<PeerEvent>(100);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let state = Arc::new(RwLock::new(ChannelState::Disconnected));

        let client = ChannelClient {
            config,
            state: state.clone(),
            outgoing_rx,
            incoming_tx,
            shutdown_rx,
        };

        tokio::spawn(client.run());

        let handle = ChannelHandle {
            outgoing_tx,
            state,
            shutdown_tx,
        };

        (handle, incoming_rx)
    }

    /// Main client loop: connect, pump, back off, repeat.
    async fn run(mut self) {
        info!(url = %self.config.url, room = %self.config.room, "Channel client starting");

        let mut backoff = self.create_backoff();

        loop {
            if self.shutdown_rx.try_recv().is_ok() {
                info!("Channel client received shutdown signal");
                break;
            }

            *self.state.write().await = ChannelState::Connecting;

            match self.connect_with_timeout().await {
                Ok(ws_stream) => {
                    info!("Channel connected");
                    *self.state.write().await = ChannelState::Connected;
                    backoff.reset();

                    match self.connection_loop(ws_stream).await {
                        Ok(()) => {
                            // Clean shutdown requested.
                            break;
                        }
                        Err(e) => warn!(?e, "Channel connection lost"),
                    }
                }
                Err(e) => {
                    error!(?e, "Channel connect failed");
                }
            }

            *self.state.write().await = ChannelState::Backoff;

            if let Some(duration) = backoff.next_backoff() {
                debug!(?duration, "Waiting before channel reconnect");
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        *self.state.write().await = ChannelState::Reconnecting;
                    }
                    _ = self.shutdown_rx.recv() => {
                        info!("Shutdown during channel backoff");
                        break;
                    }
                }
            } else {
                error!("Channel backoff exhausted");
                break;
            }
        }

        *self.state.write().await = ChannelState::Disconnected;
        info!("Channel client stopped");
    }

    /// Connects with timeout.
    async fn connect_with_timeout(
        &self,
    ) -> SyncResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let connect_future = connect_async(&self.config.url);

        match timeout(self.config.connect_timeout, connect_future).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "Channel handshake complete");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
        }
    }

    /// Pump loop for one live connection. `Ok(())` means shutdown was
    /// requested; `Err` means the connection dropped and we reconnect.
    async fn connection_loop(
        &mut self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> SyncResult<()> {
        let (mut write, mut read) = ws_stream.split();

        // Join the tenant room so the server scopes fan-out to us.
        let join = PeerEvent {
            event: "join".to_string(),
            payload: serde_json::json!({ "room": self.config.room }),
            user_id: None,
            timestamp: Some(Utc::now()),
        };
        write.send(WsMessage::Text(join.to_json()?.into())).await?;
        debug!(room = %self.config.room, "Joined tenant room");

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Outbound events
                Some(event) = self.outgoing_rx.recv() => {
                    let json = event.to_json()?;
                    debug!(event = %event.event, "Publishing event");
                    write.send(WsMessage::Text(json.into())).await?;
                }

                // Inbound events
                Some(result) = read.next() => {
                    match result {
                        Ok(WsMessage::Text(text)) => {
                            match PeerEvent::from_json(&text) {
                                Ok(event) => {
                                    debug!(event = %event.event, "Received peer event");
                                    if self.incoming_tx.send(event).await.is_err() {
                                        warn!("Peer event receiver dropped");
                                        return Err(SyncError::ChannelError("Receiver dropped".into()));
                                    }
                                }
                                Err(e) => {
                                    warn!(?e, "Failed to parse peer event");
                                }
                            }
                        }
                        Ok(WsMessage::Ping(data)) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Ok(WsMessage::Pong(_)) => {
                            debug!("Received pong");
                        }
                        Ok(WsMessage::Close(frame)) => {
                            info!(?frame, "Channel received close frame");
                            return Err(SyncError::Disconnected);
                        }
                        Ok(WsMessage::Binary(_)) => {
                            warn!("Unexpected binary message on channel");
                        }
                        Ok(WsMessage::Frame(_)) => {
                            // Raw frame, ignore
                        }
                        Err(e) => {
                            error!(?e, "Channel WebSocket error");
                            return Err(SyncError::from(e));
                        }
                    }
                }

                // Keepalive
                _ = ping_interval.tick() => {
                    write.send(WsMessage::Ping(vec![].into())).await?;
                    debug!("Sent channel ping");
                }

                // Shutdown
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing channel");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    /// Creates the exponential backoff configuration.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None, // Reconnect forever
            ..Default::default()
        }
    }
}
