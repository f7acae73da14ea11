//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Remote      │  │     Channel             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  RequestFailed  │  │  Disconnected           │ │
//! │  │  ConfigLoad     │  │  HttpStatus     │  │  WebSocketError         │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  InvalidEvent           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Local store   │  │     Guards      │  │      Locks              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Database       │  │  TenantMismatch │  │  LockHeld               │ │
//! │  │  Serialization  │  │                 │  │  NotLockOwner           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible engine failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    /// Invalid API or channel URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    // =========================================================================
    // Remote API Errors
    // =========================================================================
    /// HTTP request could not be sent or completed.
    #[error("Remote request failed: {0}")]
    RequestFailed(String),

    /// Remote returned a non-success status the driver treats as failure.
    #[error("Remote returned HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// Request timed out.
    #[error("Remote request timed out after {0} seconds")]
    Timeout(u64),

    // =========================================================================
    // Realtime Channel Errors
    // =========================================================================
    /// Channel is not connected.
    #[error("Realtime channel disconnected")]
    Disconnected,

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// An inbound event could not be parsed.
    #[error("Invalid realtime event: {0}")]
    InvalidEvent(String),

    // =========================================================================
    // Tenant Guard
    // =========================================================================
    /// An item or row disagreed with the active tenant. Defense-in-depth;
    /// the offending record is never transmitted or applied.
    #[error("Tenant mismatch: expected {expected}, got {actual}")]
    TenantMismatch { expected: String, actual: String },

    // =========================================================================
    // Lock Errors
    // =========================================================================
    /// Another user holds the lock.
    #[error("Record {key} is locked by {holder}")]
    LockHeld { key: String, holder: String },

    /// Only the holder may release or extend a lock.
    #[error("Not the lock owner for {key}")]
    NotLockOwner { key: String },

    // =========================================================================
    // Local Store Errors
    // =========================================================================
    /// Local store operation failed.
    #[error("Local store error: {0}")]
    Database(String),

    /// Failed to (de)serialize a payload.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<ledger_db::DbError> for SyncError {
    fn from(err: ledger_db::DbError) -> Self {
        SyncError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else {
            SyncError::RequestFailed(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::RequestFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if this error is transient and the work should be
    /// retried on the next `run_sync`.
    ///
    /// Non-retriable categories (config, tenant mismatch, lock ownership)
    /// need explicit resolution instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RequestFailed(_)
            | SyncError::Timeout(_)
            | SyncError::Disconnected
            | SyncError::WebSocketError(_)
            | SyncError::TlsError(_) => true,
            // 5xx is transient; 4xx is semantic.
            SyncError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::InvalidUrl(_)
        )
    }
}
