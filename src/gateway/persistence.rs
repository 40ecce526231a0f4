//! Durable key-value stores.
//!
//! The config store reads and writes whole documents by key. Where they
//! live is pluggable: JSON files in a directory, SQLite (see
//! [`super::database`]), or memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;

use super::errors::GatewayError;

/// Read-whole / write-whole document storage.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// The stored document, or `None` if the key was never written.
    async fn read(&self, key: &str) -> Result<Option<String>, GatewayError>;

    /// Replace the document under `key`.
    async fn write(&self, key: &str, value: &str) -> Result<(), GatewayError>;
}

// ─── JSON files ──────────────────────────────────────────────────────────────

/// One `<key>.json` file per key in a directory.
///
/// Writes go to a temp file that is renamed over the target, so a crash
/// leaves either the old or the new document.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| GatewayError::Storage {
            reason: format!("cannot create {}: {e}", dir.display()),
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl KvStore for JsonFileStore {
    async fn read(&self, key: &str) -> Result<Option<String>, GatewayError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GatewayError::Storage {
                reason: format!("cannot read {key}: {e}"),
            }),
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        let target = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        let persist_err = |e: std::io::Error| GatewayError::Persistence {
            key: key.to_string(),
            reason: e.to_string(),
        };
        tokio::fs::write(&tmp, value).await.map_err(persist_err)?;
        tokio::fs::rename(&tmp, &target).await.map_err(persist_err)
    }
}

// ─── Memory ──────────────────────────────────────────────────────────────────

/// Volatile store; also used by tests to inject write failures.
#[derive(Default)]
pub struct MemoryStore {
    docs: StdMutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of a stored document.
    pub fn get(&self, key: &str) -> Option<String> {
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<String>, GatewayError> {
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::Persistence {
                key: key.to_string(),
                reason: "writes disabled".into(),
            });
        }
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("conf")).unwrap();

        assert_eq!(store.read("user_backends").await.unwrap(), None);
        store.write("user_backends", "{\"a\":{}}").await.unwrap();
        store.write("user_backends", "{\"b\":{}}").await.unwrap();
        assert_eq!(
            store.read("user_backends").await.unwrap().as_deref(),
            Some("{\"b\":{}}")
        );
        assert!(dir.path().join("conf/user_backends.json").exists());
        assert!(!dir.path().join("conf/.user_backends.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.write("k", "1").await.unwrap();
        store.set_fail_writes(true);
        let err = store.write("k", "2").await.unwrap_err();
        assert!(matches!(err, GatewayError::Persistence { .. }));
        assert_eq!(store.get("k").as_deref(), Some("1"));
    }
}
