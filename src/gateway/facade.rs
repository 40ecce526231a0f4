//! Gateway facade.
//!
//! The operations the HTTP layer (or any other caller) drives: list, add and
//! remove backends, fetch a catalog, run a chat turn. Mutating operations
//! hold the caller's session lock from start to finish; reads copy the
//! session's published view instead.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;

use super::chat::{ChatEvent, ChatOrchestrator, ChatTurnRequest, ToolInvoker, TurnContext};
use super::config_store::ConfigStore;
use super::errors::GatewayError;
use super::registry::SessionRegistry;
use super::session::{BackendEntry, LiveView, SessionBackends, UserSession};
use super::types::{AddBackendRequest, BackendSummary, ToolCatalog, UserInfo};
use crate::mcp_client::{BackendConfig, BackendConnector, ToolBackend, ToolNamespace};

pub struct Gateway {
    registry: Arc<SessionRegistry>,
    config: Arc<ConfigStore>,
    connector: Arc<dyn BackendConnector>,
    namespace: Arc<ToolNamespace>,
    allowed_commands: Option<HashSet<String>>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(config: Arc<ConfigStore>, connector: Arc<dyn BackendConnector>) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&config),
            Arc::clone(&connector),
        ));
        Self {
            registry,
            config,
            connector,
            namespace: Arc::new(ToolNamespace::new()),
            allowed_commands: None,
            sweeper: StdMutex::new(None),
        }
    }

    /// Restrict subprocess backends to these executables.
    pub fn with_allowed_commands(mut self, allowed: Option<HashSet<String>>) -> Self {
        self.allowed_commands = allowed;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Start the idle sweep; replaces any sweeper already running.
    pub fn start_sweeper(&self, interval: Duration, idle_threshold: Duration) {
        let task = self.registry.spawn_sweeper(interval, idle_threshold);
        if let Some(previous) = self.lock_sweeper().replace(task) {
            previous.abort();
        }
        tracing::info!(
            interval_secs = interval.as_secs(),
            idle_secs = idle_threshold.as_secs(),
            "idle sweeper started"
        );
    }

    // ─── Reads ───────────────────────────────────────────────────────────

    /// Global backends plus this user's live ones, ordered by id.
    pub async fn list_backends(&self, user_id: &str) -> Vec<BackendSummary> {
        let (_session, live) = self.live_backends(user_id).await;

        let mut rows: BTreeMap<String, BackendSummary> = self
            .config
            .global_configs()
            .into_iter()
            .map(|(id, config)| {
                let row = BackendSummary {
                    display_name: config.display_name(&id),
                    id: id.clone(),
                    state: None,
                    kind: Some(config.kind()),
                    shared: true,
                };
                (id, row)
            })
            .collect();

        for (id, entry) in &live {
            let row = rows.entry(id.clone()).or_insert_with(|| BackendSummary {
                id: id.clone(),
                display_name: entry.display_name.clone(),
                state: None,
                kind: None,
                shared: false,
            });
            row.display_name = entry.display_name.clone();
            row.state = Some(entry.handle.state());
            row.kind = Some(entry.handle.kind());
        }

        for row in rows.values_mut() {
            if self.config.user_config(user_id, &row.id).is_some() {
                row.shared = false;
            }
        }
        rows.into_values().collect()
    }

    /// Namespaced catalog of one of the user's live backends.
    pub async fn get_tool_catalog(
        &self,
        user_id: &str,
        backend_id: &str,
    ) -> Result<ToolCatalog, GatewayError> {
        let (_session, mut live) = self.live_backends(user_id).await;
        let handle = live
            .remove(backend_id)
            .map(|entry| entry.handle)
            .ok_or_else(|| GatewayError::NotFound {
                backend_id: backend_id.to_string(),
            })?;

        let tools = match handle.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(
                    user_id,
                    backend = %backend_id,
                    error = %e,
                    "tool listing failed, using catalog from connect"
                );
                handle.tools()
            }
        };
        Ok(ToolCatalog::build(backend_id, &tools, &self.namespace))
    }

    /// Effective stored config for `backend_id`.
    pub fn get_backend_config(
        &self,
        user_id: &str,
        backend_id: &str,
    ) -> Result<BackendConfig, GatewayError> {
        self.config
            .effective_config(user_id, backend_id)
            .ok_or_else(|| GatewayError::NotFound {
                backend_id: backend_id.to_string(),
            })
    }

    /// Record identity metadata on the user's session and describe it.
    pub async fn user_info(
        &self,
        user_id: &str,
        identity: BTreeMap<String, String>,
    ) -> UserInfo {
        let (session, live) = self.live_backends(user_id).await;
        let live_backends = live.len();

        if !identity.is_empty() {
            session.set_identity(identity);
        }
        UserInfo {
            user_id: session.user_id().to_string(),
            session_id: session.session_id().to_string(),
            session_created_at: session.created_at(),
            live_backends,
            identity: session.identity(),
        }
    }

    // ─── Mutations ───────────────────────────────────────────────────────

    /// Connect a new backend for the user and persist its config.
    ///
    /// Nothing is registered unless the connect succeeds. A failed config
    /// write is logged; the backend stays connected.
    pub async fn add_backend(
        &self,
        user_id: &str,
        request: AddBackendRequest,
    ) -> Result<ToolCatalog, GatewayError> {
        let (backend_id, config) = request.resolve()?;
        config
            .validate(self.allowed_commands.as_ref())
            .map_err(|e| GatewayError::InvalidConfig {
                reason: e.to_string(),
            })?;

        let (session, mut guard) = self.lock_session(user_id).await;
        if guard.contains(&backend_id) {
            return Err(GatewayError::DuplicateId { backend_id });
        }

        let handle = match self.connector.connect(&backend_id, &config).await {
            Ok(handle) => handle,
            Err(source) => {
                tracing::warn!(
                    user_id,
                    session_id = %session.session_id(),
                    backend = %backend_id,
                    error = %source,
                    "failed to add backend"
                );
                return Err(GatewayError::Connect { backend_id, source });
            }
        };

        let catalog = ToolCatalog::build(&backend_id, &handle.tools(), &self.namespace);
        guard.insert(
            &backend_id,
            BackendEntry {
                handle,
                display_name: config.display_name(&backend_id),
            },
        );
        tracing::info!(
            user_id,
            session_id = %session.session_id(),
            backend = %backend_id,
            tools = catalog.tools.len(),
            "backend added"
        );

        if let Err(e) = self
            .config
            .put_user_config(user_id, &backend_id, config)
            .await
        {
            tracing::warn!(user_id, backend = %backend_id, error = %e, "backend config not persisted");
        }
        Ok(catalog)
    }

    /// Disconnect and forget a backend the user added.
    ///
    /// Backends that exist only in the global config are refused with
    /// [`GatewayError::SharedBackend`].
    pub async fn remove_backend(&self, user_id: &str, backend_id: &str) -> Result<(), GatewayError> {
        let (session, mut guard) = self.lock_session(user_id).await;

        let user_owned = self.config.user_config(user_id, backend_id).is_some();
        if !user_owned && self.config.global_configs().contains_key(backend_id) {
            return Err(GatewayError::SharedBackend {
                backend_id: backend_id.to_string(),
            });
        }

        let entry = guard.remove(backend_id);
        if entry.is_none() && !user_owned {
            return Err(GatewayError::NotFound {
                backend_id: backend_id.to_string(),
            });
        }
        if let Some(entry) = entry {
            entry.handle.disconnect().await;
        }

        if let Err(e) = self.config.delete_user_config(user_id, backend_id).await {
            tracing::warn!(user_id, backend = %backend_id, error = %e, "backend removal not persisted");
        }
        tracing::info!(
            user_id,
            session_id = %session.session_id(),
            backend = %backend_id,
            "backend removed"
        );
        Ok(())
    }

    /// Run one chat turn with the user's tools, holding the session for
    /// the whole turn. An orchestrator failure is also sent as
    /// [`ChatEvent::Error`].
    pub async fn run_chat_turn(
        &self,
        user_id: &str,
        request: ChatTurnRequest,
        orchestrator: &dyn ChatOrchestrator,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<(), GatewayError> {
        let (session, guard) = self.lock_session(user_id).await;

        let selected: Vec<(&String, &BackendEntry)> = if request.backend_ids.is_empty() {
            guard.iter().collect()
        } else {
            request
                .backend_ids
                .iter()
                .filter_map(|id| match guard.get(id) {
                    Some(entry) => Some((id, entry)),
                    None => {
                        tracing::warn!(user_id, backend = %id, "requested backend is not live");
                        None
                    }
                })
                .collect()
        };

        let mut tools = Vec::new();
        let mut handles: BTreeMap<String, Arc<dyn ToolBackend>> = BTreeMap::new();
        for (id, entry) in selected {
            tools.extend(ToolCatalog::build(id, &entry.handle.tools(), &self.namespace).tools);
            handles.insert(id.clone(), Arc::clone(&entry.handle));
        }

        let context = TurnContext {
            user_id: user_id.to_string(),
            session_id: session.session_id().to_string(),
            tools,
            invoker: ToolInvoker::new(Arc::clone(&self.namespace), handles),
        };
        tracing::debug!(
            user_id,
            session_id = %session.session_id(),
            model = %request.model,
            tools = context.tools.len(),
            "chat turn started"
        );

        let result = orchestrator
            .run_turn(request, context, events.clone())
            .await;
        drop(guard);
        session.touch();

        if let Err(e) = &result {
            tracing::warn!(user_id, session_id = %session.session_id(), error = %e, "chat turn failed");
            let _ = events
                .send(ChatEvent::Error {
                    message: e.to_string(),
                })
                .await;
        }
        result
    }

    /// Stop sweeping, close every session and flush configs.
    pub async fn shutdown(&self) {
        if let Some(task) = self.lock_sweeper().take() {
            task.abort();
        }
        self.registry.shutdown_all().await;
        if let Err(e) = self.config.flush().await {
            tracing::error!(error = %e, "final config flush failed");
        }
        tracing::info!("gateway shut down");
    }

    // ─── Internals ───────────────────────────────────────────────────────

    /// The user's live session, locked.
    ///
    /// A session can be evicted between lookup and lock; the closed one is
    /// dropped and a fresh session is taken instead.
    async fn lock_session(
        &self,
        user_id: &str,
    ) -> (Arc<UserSession>, OwnedMutexGuard<SessionBackends>) {
        loop {
            let session = self.registry.get_or_create(user_id).await;
            let guard = session.lock().await;
            if !guard.is_closed() {
                return (session, guard);
            }
            tracing::debug!(user_id, "session closed while waiting, retrying");
        }
    }

    /// Snapshot of the user's live backends that does not wait behind a
    /// running mutation. Falls back to the lock while the session is still
    /// being restored.
    async fn live_backends(
        &self,
        user_id: &str,
    ) -> (Arc<UserSession>, BTreeMap<String, BackendEntry>) {
        loop {
            let session = self.registry.get_or_create(user_id).await;
            match session.live_view() {
                LiveView::Ready(entries) => return (session, entries),
                LiveView::Closed => {}
                LiveView::Restoring => {
                    let guard = session.lock().await;
                    if !guard.is_closed() {
                        let entries = guard
                            .iter()
                            .map(|(id, entry)| (id.clone(), entry.clone()))
                            .collect();
                        return (session, entries);
                    }
                }
            }
            tracing::debug!(user_id, "session closed while reading, retrying");
        }
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
