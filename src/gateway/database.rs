//! SQLite-backed key-value store.
//!
//! Uses `rusqlite` synchronously on the blocking pool. WAL mode is enabled
//! so readers are not blocked by the occasional config write.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::errors::GatewayError;
use super::persistence::KvStore;

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite database holding gateway documents.
pub struct SqliteStore {
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, GatewayError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| GatewayError::Storage {
            reason: format!("database task failed: {e}"),
        })?
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn read(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv_store WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                params![key, value],
            )
            .map_err(|e| GatewayError::Persistence {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            Ok(())
        })
        .await
    }
}
