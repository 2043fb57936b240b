/// Persistence adapter.
///
/// A narrow SQLite layer the core reads and writes through: wrapped-key
/// rows, interaction headers, and cipher blobs. Multi-row mutations
/// (capture commit, master-key rotation) run in a single transaction.
pub mod interactions;
pub mod keys;
pub mod models;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::{CoreError, Result};

pub(crate) fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::Storage(e.to_string())
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `database_url`.
    ///
    /// In-memory databases are pinned to a single connection so every
    /// caller sees the same store.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err)?
            .create_if_missing(true);

        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        Ok(Self { pool })
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(format!("migration failed: {e}")))
    }

    /// Fresh migrated in-memory database, for tests and local runs.
    pub async fn in_memory() -> Result<Self> {
        let db = Self::connect("sqlite::memory:").await?;
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
