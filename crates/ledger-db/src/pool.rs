//! # Database Pool Management
//!
//! Connection pool creation and configuration for the local SQLite store.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Local Store Connection Pool                        │
//! │                                                                         │
//! │  App Startup                                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbConfig::new(path) ← Configure pool settings                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::new(config).await ← Create pool + bootstrap schema          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  db.outbox() / db.metadata() / db.conflicts() / db.locks() /           │
//! │  db.entities() ← Repository handles sharing the pool                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! SQLite WAL (Write-Ahead Logging) mode is enabled for:
//! - Better concurrent read performance
//! - Readers don't block writers
//! - Better crash recovery

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::conflict::ConflictRepository;
use crate::repository::entity::EntityRepository;
use crate::repository::lock::LockRepository;
use crate::repository::metadata::MetadataRepository;
use crate::repository::outbox::OutboxRepository;
use crate::schema;

// =============================================================================
// Configuration
// =============================================================================

/// Local store configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    /// Default: 5 (sufficient for a per-user local store)
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    pub min_connections: u32,

    /// Connection timeout duration.
    pub connect_timeout: Duration,

    /// Idle timeout before closing a connection.
    pub idle_timeout: Duration,
}

impl DbConfig {
    /// Creates a new configuration for the given database path.
    /// The file is created if it does not exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Creates an in-memory database configuration (for testing).
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1, // In-memory requires single connection
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Main local store handle providing repository access.
///
/// Clones share the pool and the capture flag; repositories are cheap
/// to construct per call.
#[derive(Debug, Clone)]
pub struct Database {
    /// The SQLite connection pool.
    pool: SqlitePool,

    /// Write-triggered outbox capture. When false, local-mutation writes
    /// do not enqueue outbox items (downstream apply runs with this off).
    capture_enabled: Arc<AtomicBool>,
}

impl Database {
    /// Creates the connection pool and bootstraps the sync tables.
    ///
    /// SQLite is configured with WAL journaling, NORMAL synchronous, and
    /// foreign keys enabled.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Initializing local store"
        );

        // sqlite://path?mode=rwc creates the file if not exists
        let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());

        let connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        debug!("Connection options configured");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            max_connections = config.max_connections,
            "Local store pool created"
        );

        let db = Database {
            pool,
            capture_enabled: Arc::new(AtomicBool::new(true)),
        };

        schema::bootstrap(&db.pool).await?;

        Ok(db)
    }

    /// Returns a reference to the connection pool.
    ///
    /// For advanced queries not covered by repositories. Prefer the
    /// repository methods when available.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the outbox repository.
    pub fn outbox(&self) -> OutboxRepository {
        OutboxRepository::new(self.pool.clone())
    }

    /// Returns the sync metadata repository.
    pub fn metadata(&self) -> MetadataRepository {
        MetadataRepository::new(self.pool.clone())
    }

    /// Returns the conflict log repository.
    pub fn conflicts(&self) -> ConflictRepository {
        ConflictRepository::new(self.pool.clone())
    }

    /// Returns the record-lock repository.
    pub fn locks(&self) -> LockRepository {
        LockRepository::new(self.pool.clone())
    }

    /// Returns the generic entity store.
    pub fn entities(&self) -> EntityRepository {
        EntityRepository::new(self.pool.clone(), self.capture_enabled.clone())
    }

    /// Whether write-triggered outbox capture is currently on.
    pub fn capture_enabled(&self) -> bool {
        self.capture_enabled.load(Ordering::SeqCst)
    }

    /// Suspends write-triggered outbox capture for the lifetime of the
    /// returned guard. Used while applying remote rows; those writes are
    /// not local mutations and must not re-enter the outbox.
    pub fn suspend_capture(&self) -> CaptureGuard {
        self.capture_enabled.store(false, Ordering::SeqCst);
        CaptureGuard {
            capture_enabled: self.capture_enabled.clone(),
        }
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        info!("Closing local store pool");
        self.pool.close().await;
    }

    /// Checks if the store is responsive.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

// =============================================================================
// Capture Guard
// =============================================================================

/// Re-enables outbox capture when dropped, on every exit path.
#[must_use = "capture stays suspended only while the guard lives"]
pub struct CaptureGuard {
    capture_enabled: Arc<AtomicBool>,
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.capture_enabled.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);
    }

    #[tokio::test]
    async fn test_capture_guard_restores_flag() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.capture_enabled());
        {
            let _guard = db.suspend_capture();
            assert!(!db.capture_enabled());
        }
        assert!(db.capture_enabled());
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/test.db")
            .max_connections(10)
            .min_connections(2);

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
    }
}
