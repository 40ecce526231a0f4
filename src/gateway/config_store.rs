//! Backend configuration store.
//!
//! Holds the global (shared) backend map and every user's private map.
//! Global backends come from two layers: entries written through
//! [`ConfigStore::put_global_config`], which are persisted, and entries
//! seeded from the settings file, which live only in memory and are
//! rebuilt from that file on every start. In-memory state is authoritative for the running process; each mutation
//! is followed by a write of the affected document to the [`KvStore`] so
//! the configuration survives a restart. A failed write is reported to the
//! caller but the in-memory change stays.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio::sync::Mutex;

use super::errors::GatewayError;
use super::persistence::KvStore;
use crate::mcp_client::BackendConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Document holding `{user_id: {backend_id: config}}`.
pub const USER_BACKENDS_KEY: &str = "user_backends";

/// Document holding `{backend_id: config}` for shared backends.
pub const GLOBAL_BACKENDS_KEY: &str = "global_backends";

pub type BackendMap = BTreeMap<String, BackendConfig>;

#[derive(Default)]
struct Maps {
    /// Persisted global entries.
    global: BackendMap,
    /// Settings-file entries; never written.
    seeded: BackendMap,
    users: BTreeMap<String, BackendMap>,
}

impl Maps {
    /// Persisted globals overlaid with the settings file.
    fn merged_global(&self) -> BackendMap {
        let mut merged = self.global.clone();
        merged.extend(self.seeded.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    fn global_entry(&self, backend_id: &str) -> Option<&BackendConfig> {
        self.seeded
            .get(backend_id)
            .or_else(|| self.global.get(backend_id))
    }
}

// ─── ConfigStore ─────────────────────────────────────────────────────────────

pub struct ConfigStore {
    store: Arc<dyn KvStore>,
    maps: StdMutex<Maps>,
    /// Serializes snapshot-and-write so an older snapshot never lands last.
    persist_lock: Mutex<()>,
}

impl ConfigStore {
    /// Empty store backed by `store`; nothing is read.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            maps: StdMutex::new(Maps::default()),
            persist_lock: Mutex::new(()),
        }
    }

    /// Load both documents from `store`.
    ///
    /// A document that is not a JSON object fails the load. Individual
    /// entries that do not parse as a backend config are skipped.
    pub async fn load(store: Arc<dyn KvStore>) -> Result<Self, GatewayError> {
        let global = match store.read(GLOBAL_BACKENDS_KEY).await? {
            Some(doc) => parse_backend_map(parse_document(&doc, GLOBAL_BACKENDS_KEY)?, None),
            None => BackendMap::new(),
        };

        let mut users = BTreeMap::new();
        if let Some(doc) = store.read(USER_BACKENDS_KEY).await? {
            for (user_id, entries) in parse_document(&doc, USER_BACKENDS_KEY)? {
                let Value::Object(entries) = entries else {
                    tracing::warn!(user_id = %user_id, "skipping malformed user backend map");
                    continue;
                };
                let map = parse_backend_map(entries.into_iter().collect(), Some(&user_id));
                if !map.is_empty() {
                    users.insert(user_id, map);
                }
            }
        }

        tracing::info!(
            global = global.len(),
            users = users.len(),
            "loaded backend configs"
        );

        Ok(Self {
            store,
            maps: StdMutex::new(Maps {
                global,
                seeded: BackendMap::new(),
                users,
            }),
            persist_lock: Mutex::new(()),
        })
    }

    // ─── Reads ───────────────────────────────────────────────────────────

    /// Global map overlaid with the user's map; user entries win.
    pub fn get_effective_configs(&self, user_id: &str) -> BackendMap {
        let maps = self.lock_maps();
        let mut effective = maps.merged_global();
        if let Some(user) = maps.users.get(user_id) {
            effective.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        effective
    }

    /// The effective config for one backend.
    pub fn effective_config(&self, user_id: &str, backend_id: &str) -> Option<BackendConfig> {
        let maps = self.lock_maps();
        maps.users
            .get(user_id)
            .and_then(|m| m.get(backend_id))
            .or_else(|| maps.global_entry(backend_id))
            .cloned()
    }

    pub fn user_config(&self, user_id: &str, backend_id: &str) -> Option<BackendConfig> {
        self.lock_maps()
            .users
            .get(user_id)
            .and_then(|m| m.get(backend_id))
            .cloned()
    }

    pub fn global_configs(&self) -> BackendMap {
        self.lock_maps().merged_global()
    }

    // ─── Mutations ───────────────────────────────────────────────────────

    pub async fn put_user_config(
        &self,
        user_id: &str,
        backend_id: &str,
        config: BackendConfig,
    ) -> Result<(), GatewayError> {
        self.lock_maps()
            .users
            .entry(user_id.to_string())
            .or_default()
            .insert(backend_id.to_string(), config);
        self.persist_users().await
    }

    /// Remove a user entry. Returns whether anything was removed; nothing is
    /// written when it was absent.
    pub async fn delete_user_config(
        &self,
        user_id: &str,
        backend_id: &str,
    ) -> Result<bool, GatewayError> {
        let removed = {
            let mut maps = self.lock_maps();
            let removed = maps
                .users
                .get_mut(user_id)
                .map(|m| m.remove(backend_id).is_some())
                .unwrap_or(false);
            if maps.users.get(user_id).is_some_and(|m| m.is_empty()) {
                maps.users.remove(user_id);
            }
            removed
        };
        if removed {
            self.persist_users().await?;
        }
        Ok(removed)
    }

    pub async fn put_global_config(
        &self,
        backend_id: &str,
        config: BackendConfig,
    ) -> Result<(), GatewayError> {
        {
            let mut maps = self.lock_maps();
            maps.seeded.remove(backend_id);
            maps.global.insert(backend_id.to_string(), config);
        }
        self.persist_global().await
    }

    /// Replace the settings-file layer of the global map. These entries
    /// shadow persisted globals with the same id and are never written.
    pub fn seed_global(&self, entries: BackendMap) {
        for id in entries.keys() {
            tracing::debug!(backend = %id, "registered global backend");
        }
        self.lock_maps().seeded = entries;
    }

    /// Write both documents. Settings-file entries are left out.
    pub async fn flush(&self) -> Result<(), GatewayError> {
        self.persist_global().await?;
        self.persist_users().await
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn lock_maps(&self) -> std::sync::MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist_users(&self) -> Result<(), GatewayError> {
        let _guard = self.persist_lock.lock().await;
        let doc = serde_json::to_string_pretty(&self.lock_maps().users);
        self.write_doc(USER_BACKENDS_KEY, doc).await
    }

    async fn persist_global(&self) -> Result<(), GatewayError> {
        let _guard = self.persist_lock.lock().await;
        let doc = serde_json::to_string_pretty(&self.lock_maps().global);
        self.write_doc(GLOBAL_BACKENDS_KEY, doc).await
    }

    async fn write_doc(
        &self,
        key: &str,
        doc: Result<String, serde_json::Error>,
    ) -> Result<(), GatewayError> {
        let doc = doc.map_err(|e| GatewayError::Persistence {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        match self.store.write(key, &doc).await {
            Ok(()) => {
                tracing::debug!(key, bytes = doc.len(), "persisted backend configs");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to persist backend configs");
                Err(e)
            }
        }
    }
}

/// Top-level `{id: value}` object of a stored document.
fn parse_document(doc: &str, key: &str) -> Result<BTreeMap<String, Value>, GatewayError> {
    serde_json::from_str(doc).map_err(|e| GatewayError::Storage {
        reason: format!("malformed {key} document: {e}"),
    })
}

/// Parse `{backend_id: config}`, skipping entries that do not parse.
fn parse_backend_map(raw: BTreeMap<String, Value>, user_id: Option<&str>) -> BackendMap {
    let mut map = BackendMap::new();
    for (backend_id, value) in raw {
        match serde_json::from_value::<BackendConfig>(value) {
            Ok(config) => {
                map.insert(backend_id, config);
            }
            Err(e) => {
                tracing::warn!(
                    user_id = user_id.unwrap_or("-"),
                    backend = %backend_id,
                    error = %e,
                    "skipping malformed backend config"
                );
            }
        }
    }
    map
}

// ─── Tests ───────────────────────────────────────────────────────────────────
