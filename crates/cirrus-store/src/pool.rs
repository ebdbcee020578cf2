//! Database connection pool management
//!
//! Wraps SQLx's SqlitePool with automatic directory creation, WAL journal
//! mode for concurrent reads, schema migration on first connection, and an
//! in-memory mode for testing.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::StoreError;

/// Pool of SQLite connections for one mount's state database
///
/// Configured with WAL journal mode, 5 max connections for file-backed
/// databases (1 for in-memory, which is per-connection), and a 5-second
/// busy timeout to ride out write contention.
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if missing) the database at `db_path` and runs the
    /// schema migration.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Connection` if the file cannot be opened or the
    /// migration fails.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                StoreError::Connection(format!(
                    "failed to connect to database at {}: {e}",
                    db_path.display()
                ))
            })?;

        Self::run_migrations(&pool).await?;

        tracing::info!(path = %db_path.display(), "metadata store opened");
        Ok(Self { pool })
    }

    /// Creates an in-memory database for tests. Uses a single connection so
    /// the data survives across queries.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                StoreError::Connection(format!("failed to create in-memory database: {e}"))
            })?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns the underlying SQLite connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        let migration_sql = include_str!("migrations/initial.sql");
        sqlx::raw_sql(migration_sql)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Connection(format!("schema migration failed: {e}")))?;
        Ok(())
    }
}
