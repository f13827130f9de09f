//! Metadata store connection management and migrations
//!
//! Wraps a SQLite connection pool. All step runtime state lives here; the
//! dependency edges and payloads live in the blob bucket.

use crate::error::{HubError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Type alias for the database connection pool
pub type DatabasePool = SqlitePool;

/// Database connection wrapper
#[derive(Clone, Debug)]
pub struct Database {
    pub(crate) pool: Arc<DatabasePool>,
}

impl Database {
    /// Open (creating if missing) the metadata store at `database_path`.
    ///
    /// Write-ahead logging is enabled so the single-writer mutation stream
    /// does not block concurrent readers.
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        Self::with_max_connections(database_path, 10).await
    }

    /// Open the metadata store with a custom pool size.
    pub async fn with_max_connections<P: AsRef<Path>>(
        database_path: P,
        max_connections: u32,
    ) -> Result<Self> {
        let path = database_path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    HubError::Database(format!("failed to create database directory: {}", e))
                })?;
            }
        }

        debug!(path = %path.display(), "connecting to metadata store");

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| HubError::Database(format!("failed to connect to database: {}", e)))?;

        info!(path = %path.display(), "metadata store connection established");

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Run the embedded migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("running metadata store migrations");

        sqlx::migrate!("./migrations")
            .run(self.pool.as_ref())
            .await
            .map_err(|e| HubError::Database(format!("migration failed: {}", e)))?;

        Ok(())
    }

    /// Perform a health check by running a simple query
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| HubError::Database(format!("health check failed: {}", e)))?;

        Ok(())
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
        info!("metadata store connection closed");
    }

    /// Open the store and bring the schema up to date.
    pub async fn initialize<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let db = Self::new(database_path).await?;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Create an in-memory test database with migrations applied.
    ///
    /// The pool is capped at one connection: each in-memory SQLite
    /// connection is its own database, so a wider pool would scatter state.
    pub async fn test_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                HubError::Database(format!("failed to connect to in-memory database: {}", e))
            })?;

        let db = Self {
            pool: Arc::new(pool),
        };

        db.run_migrations().await?;
        Ok(db)
    }
}
