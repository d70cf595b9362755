//! Database module for the offline sync engine
//!
//! Provides a SQLite-backed key/value store used to persist the operation
//! queue, the dead-letter archive and engine configuration across restarts.

use rusqlite::{params, Connection};
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::offline::store::{QueueStore, StoreError};

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) a database file and initialise its schema
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(4)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        log::info!("Database opened at {:?}", db_path);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every SQLite `:memory:` connection is a separate database, so the pool
    /// is pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn initialize_schema(conn: &Connection) -> DbResult<()> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    // =========================================================================
    // KEY/VALUE
    // =========================================================================

    /// Read the raw value stored under `key`
    pub fn get_raw(&self, key: &str) -> DbResult<Option<String>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a raw value under `key`, replacing any previous value
    pub fn set_raw(&self, key: &str, value: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Delete the value stored under `key`
    pub fn remove_raw(&self, key: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(())
    }

    /// List every stored key
    pub fn keys(&self) -> DbResult<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(DbError::from)
    }

    /// Get a JSON-encoded setting value
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        match self.get_raw(key)? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| DbError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Set a JSON-encoded setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let json =
            serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;
        self.set_raw(key, &json)
    }
}

impl QueueStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.get_raw(key).map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn set(&self, key: &str, blob: &str) -> Result<(), StoreError> {
        self.set_raw(key, blob)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.remove_raw(key)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        self.keys().map_err(|e| StoreError::Backend(e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================
