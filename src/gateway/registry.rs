//! Session registry.
//!
//! Maps user ids to their [`UserSession`]. The registry lock only covers
//! lookup and insert; everything slow (restoring backends, disconnecting
//! evicted sessions) happens outside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

use super::config_store::ConfigStore;
use super::session::{BackendEntry, SessionBackends, UserSession};
use crate::mcp_client::BackendConnector;

pub struct SessionRegistry {
    sessions: StdMutex<HashMap<String, Arc<UserSession>>>,
    config: Arc<ConfigStore>,
    connector: Arc<dyn BackendConnector>,
}

impl SessionRegistry {
    pub fn new(config: Arc<ConfigStore>, connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            config,
            connector,
        }
    }

    /// The user's session, creating it (and restoring its configured
    /// backends) if none exists.
    ///
    /// A new session is inserted already locked, so concurrent callers for
    /// the same user get the same object and wait until restoration is done.
    pub async fn get_or_create(&self, user_id: &str) -> Arc<UserSession> {
        let (session, restore_guard) = {
            let mut sessions = self.lock_sessions();
            match sessions.get(user_id) {
                Some(existing) => (Arc::clone(existing), None),
                None => {
                    let session = Arc::new(UserSession::new(user_id));
                    let guard = session.try_lock();
                    sessions.insert(user_id.to_string(), Arc::clone(&session));
                    tracing::info!(
                        user_id,
                        session_id = %session.session_id(),
                        "session created"
                    );
                    (session, guard)
                }
            }
        };

        if let Some(guard) = restore_guard {
            // Runs detached so a cancelled caller cannot leave the session
            // half-restored and locked.
            let task = tokio::spawn(restore_backends(
                guard,
                user_id.to_string(),
                session.session_id().to_string(),
                Arc::clone(&self.config),
                Arc::clone(&self.connector),
            ));
            if let Err(e) = task.await {
                tracing::error!(user_id, error = %e, "backend restoration task failed");
            }
        }

        session.touch();
        session
    }

    /// Existing session for `user_id`, without creating one.
    pub fn get(&self, user_id: &str) -> Option<Arc<UserSession>> {
        self.lock_sessions().get(user_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every session idle for longer than `idle_threshold`.
    ///
    /// Sessions are unlinked under the registry lock and closed outside it;
    /// closing waits for any operation still running on that session.
    pub async fn sweep(&self, idle_threshold: Duration) -> usize {
        let evicted: Vec<Arc<UserSession>> = {
            let mut sessions = self.lock_sessions();
            let idle_users: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() > idle_threshold)
                .map(|(user_id, _)| user_id.clone())
                .collect();
            idle_users
                .iter()
                .filter_map(|user_id| sessions.remove(user_id))
                .collect()
        };

        if evicted.is_empty() {
            return 0;
        }
        for session in &evicted {
            tracing::info!(
                user_id = %session.user_id(),
                session_id = %session.session_id(),
                idle_secs = session.idle_for().as_secs(),
                "evicting idle session"
            );
        }
        join_all(evicted.iter().map(|s| s.close())).await;
        evicted.len()
    }

    /// Close every session and wait for all backends to be released.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<UserSession>> = self
            .lock_sessions()
            .drain()
            .map(|(_, session)| session)
            .collect();
        let count = sessions.len();
        join_all(sessions.iter().map(|s| s.close())).await;
        tracing::info!(sessions = count, "all sessions closed");
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is aborted.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        idle_threshold: Duration,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = registry.sweep(idle_threshold).await;
                tracing::debug!(
                    evicted,
                    active = registry.len(),
                    "idle session sweep finished"
                );
            }
        })
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<UserSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Reconnect every backend in the user's effective config.
///
/// Backends connect concurrently; one failure does not affect the others.
async fn restore_backends(
    mut guard: OwnedMutexGuard<SessionBackends>,
    user_id: String,
    session_id: String,
    config: Arc<ConfigStore>,
    connector: Arc<dyn BackendConnector>,
) {
    let configs = config.get_effective_configs(&user_id);
    if configs.is_empty() {
        guard.mark_restored();
        return;
    }

    let attempts = configs.iter().map(|(backend_id, backend_config)| {
        let connector = Arc::clone(&connector);
        async move {
            let result = connector.connect(backend_id, backend_config).await;
            (backend_id, backend_config, result)
        }
    });

    let mut restored = 0usize;
    let total = configs.len();
    for (backend_id, backend_config, result) in join_all(attempts).await {
        match result {
            Ok(handle) => {
                guard.insert(
                    backend_id,
                    BackendEntry {
                        handle,
                        display_name: backend_config.display_name(backend_id),
                    },
                );
                restored += 1;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    session_id = %session_id,
                    backend = %backend_id,
                    error = %e,
                    "failed to restore backend"
                );
            }
        }
    }

    tracing::info!(
        user_id = %user_id,
        session_id = %session_id,
        restored,
        total,
        "session backends restored"
    );
    guard.mark_restored();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::persistence::MemoryStore;
    use crate::gateway::test_support::FakeConnector;
    use crate::mcp_client::BackendConfig;

    async fn registry_with(
        connector: Arc<FakeConnector>,
        user_backends: &[(&str, &str)],
    ) -> Arc<SessionRegistry> {
        let config = Arc::new(ConfigStore::new(Arc::new(MemoryStore::new())));
        for (user, backend) in user_backends {
            config
                .put_user_config(user, backend, BackendConfig::subprocess("fake", &[]))
                .await
                .unwrap();
        }
        Arc::new(SessionRegistry::new(config, connector))
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_builds_one_session() {
        let connector = Arc::new(FakeConnector::new().with_delay(Duration::from_millis(50)));
        let registry = registry_with(connector.clone(), &[("alice", "fs")]).await;

        let (a, b) = tokio::join!(
            registry.get_or_create("alice"),
            registry.get_or_create("alice")
        );
        assert_eq!(a.session_id(), b.session_id());
        assert_eq!(registry.len(), 1);
        assert_eq!(connector.connects(), 1);

        // The second caller sees the restored backend once it gets the lock.
        assert!(b.lock().await.contains("fs"));
    }

    #[tokio::test]
    async fn test_partial_restore_keeps_healthy_backends() {
        let connector = Arc::new(FakeConnector::new());
        connector.fail_backend("broken");
        let registry = registry_with(connector.clone(), &[("alice", "good"), ("alice", "broken")]).await;

        let session = registry.get_or_create("alice").await;
        let guard = session.lock().await;
        assert!(guard.contains("good"));
        assert!(!guard.contains("broken"));
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_sessions() {
        let connector = Arc::new(FakeConnector::new());
        let registry = registry_with(connector.clone(), &[("alice", "fs")]).await;

        let first = registry.get_or_create("alice").await;
        let first_id = first.session_id().to_string();
        registry.get_or_create("bob").await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.get_or_create("bob").await;

        let evicted = registry.sweep(Duration::from_millis(20)).await;
        assert_eq!(evicted, 1);
        assert!(registry.get("alice").is_none());
        assert!(registry.get("bob").is_some());
        assert_eq!(connector.disconnects(), 1);
        assert!(first.lock().await.is_closed());

        let second = registry.get_or_create("alice").await;
        assert_ne!(second.session_id(), first_id);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_sweep_waits_for_in_flight_operation() {
        let connector = Arc::new(FakeConnector::new());
        let registry = registry_with(connector.clone(), &[("alice", "fs")]).await;
        let session = registry.get_or_create("alice").await;
        let guard = session.lock().await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let sweeper = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.sweep(Duration::from_millis(20)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Unlinked from the registry but not yet torn down.
        assert!(registry.get("alice").is_none());
        assert_eq!(connector.disconnects(), 0);

        drop(guard);
        assert_eq!(sweeper.await.unwrap(), 1);
        assert_eq!(connector.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_all_disconnects_everything() {
        let connector = Arc::new(FakeConnector::new());
        let registry =
            registry_with(connector.clone(), &[("alice", "a1"), ("alice", "a2"), ("bob", "b1")]).await;
        registry.get_or_create("alice").await;
        registry.get_or_create("bob").await;

        registry.shutdown_all().await;
        assert!(registry.is_empty());
        assert_eq!(connector.disconnects(), 3);
    }

    #[tokio::test]
    async fn test_sweeper_task_runs_on_interval() {
        let connector = Arc::new(FakeConnector::new());
        let registry = registry_with(connector, &[]).await;
        registry.get_or_create("carol").await;

        let task = registry.spawn_sweeper(Duration::from_millis(20), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(120)).await;
        task.abort();
        assert!(registry.is_empty());
    }
}
