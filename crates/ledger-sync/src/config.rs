//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     LEDGER_TENANT_ID=tenant-1                                          │
//! │     LEDGER_API_URL=https://api.example.com                             │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/ledgerdesk/sync.toml (Linux)                             │
//! │     ~/Library/Application Support/com.ledgerdesk.desk/sync.toml (mac)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     chunk_size = 200, cooldown = 120s, lock TTL = 5 min                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Front Desk"
//!
//! [session]
//! tenant_id = "tenant-1"
//! user_id = "user-17"
//! user_name = "Asha"
//!
//! [api]
//! base_url = "https://api.example.com"
//! request_timeout_secs = 30
//!
//! [realtime]
//! url = "wss://rt.example.com/socket"
//!
//! [engine]
//! chunk_size = 200
//! cooldown_secs = 120
//! lock_ttl_secs = 300
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Front Desk", "Accounting PC").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "LedgerDesk Client".to_string()
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Session Configuration
// =============================================================================

/// The active tenant and user this engine instance syncs for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Active tenant; every push/pull item is guarded against it.
    #[serde(default)]
    pub tenant_id: String,

    /// Current user; used for outbox attribution, lock ownership, and
    /// realtime self-echo suppression.
    #[serde(default)]
    pub user_id: String,

    /// Display name shown on locks held by this user.
    #[serde(default)]
    pub user_name: String,
}

// =============================================================================
// Remote API Settings
// =============================================================================

/// HTTP entity API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Base URL of the tenant API (e.g., "https://api.example.com").
    #[serde(default)]
    pub base_url: String,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            base_url: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Realtime Channel Settings
// =============================================================================

/// WebSocket fan-out channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSettings {
    /// WebSocket URL of the fan-out channel. Empty disables realtime.
    #[serde(default)]
    pub url: String,

    /// Connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Initial backoff duration (milliseconds) for reconnection.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) for reconnection.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        RealtimeSettings {
            url: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Engine Settings
// =============================================================================

/// Driver and lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Downstream apply chunk size; the driver yields between chunks.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Minimum wall-clock gap between connectivity-triggered syncs (seconds).
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Record lock time-to-live (seconds).
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Interval of the expired-lock sweep (seconds).
    #[serde(default = "default_lock_sweep")]
    pub lock_sweep_secs: u64,

    /// Synced outbox items older than this many days are deleted.
    #[serde(default = "default_retention_days")]
    pub outbox_retention_days: u32,
}

fn default_chunk_size() -> usize {
    200
}
fn default_cooldown() -> u64 {
    120
}
fn default_lock_ttl() -> u64 {
    300
}
fn default_lock_sweep() -> u64 {
    60
}
fn default_retention_days() -> u32 {
    7
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            chunk_size: default_chunk_size(),
            cooldown_secs: default_cooldown(),
            lock_ttl_secs: default_lock_ttl(),
            lock_sweep_secs: default_lock_sweep(),
            outbox_retention_days: default_retention_days(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceSettings,

    /// Active tenant and user.
    #[serde(default)]
    pub session: SessionSettings,

    /// HTTP entity API settings.
    #[serde(default)]
    pub api: ApiSettings,

    /// Realtime channel settings.
    #[serde(default)]
    pub realtime: RealtimeSettings,

    /// Driver and lifecycle tuning.
    #[serde(default)]
    pub engine: EngineSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::InvalidConfig("device.id must not be empty".into()));
        }

        if !self.api.base_url.is_empty() {
            let parsed = url::Url::parse(&self.api.base_url)?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(SyncError::InvalidUrl(format!(
                    "API base URL must be http(s), got: {}",
                    self.api.base_url
                )));
            }
        }

        if !self.realtime.url.is_empty()
            && !self.realtime.url.starts_with("ws://")
            && !self.realtime.url.starts_with("wss://")
        {
            return Err(SyncError::InvalidUrl(format!(
                "Realtime URL must start with ws:// or wss://, got: {}",
                self.realtime.url
            )));
        }

        if self.engine.chunk_size == 0 {
            return Err(SyncError::InvalidConfig(
                "engine.chunk_size must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("LEDGER_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("LEDGER_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(tenant) = std::env::var("LEDGER_TENANT_ID") {
            debug!(tenant_id = %tenant, "Overriding tenant from environment");
            self.session.tenant_id = tenant;
        }

        if let Ok(user) = std::env::var("LEDGER_USER_ID") {
            self.session.user_id = user;
        }

        if let Ok(url) = std::env::var("LEDGER_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.api.base_url = url;
        }

        if let Ok(url) = std::env::var("LEDGER_REALTIME_URL") {
            debug!(url = %url, "Overriding realtime URL from environment");
            self.realtime.url = url;
        }

        if let Ok(chunk) = std::env::var("LEDGER_CHUNK_SIZE") {
            if let Ok(n) = chunk.parse::<usize>() {
                self.engine.chunk_size = n;
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "ledgerdesk", "desk")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the active tenant ID.
    pub fn tenant_id(&self) -> &str {
        &self.session.tenant_id
    }

    /// Returns the current user ID.
    pub fn user_id(&self) -> &str {
        &self.session.user_id
    }

    /// Lock TTL as a duration.
    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.engine.lock_ttl_secs as i64)
    }

    /// Connectivity-trigger cooldown as a duration.
    pub fn cooldown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.engine.cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty()); // Auto-generated
        assert_eq!(config.engine.chunk_size, 200);
        assert_eq!(config.engine.cooldown_secs, 120);
        assert_eq!(config.engine.lock_ttl_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(config.validate().is_err());

        config.device.id = "dev-1".to_string();
        config.api.base_url = "ftp://nope".to_string();
        assert!(config.validate().is_err());

        config.api.base_url = "https://api.example.com".to_string();
        config.realtime.url = "http://not-ws".to_string();
        assert!(config.validate().is_err());

        config.realtime.url = "wss://rt.example.com".to_string();
        assert!(config.validate().is_ok());

        config.engine.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = SyncConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[engine]"));

        let parsed: SyncConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.engine.chunk_size, config.engine.chunk_size);
    }
}
