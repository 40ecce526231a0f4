//! Per-user sessions.
//!
//! A [`UserSession`] owns one user's live backend handles behind an async
//! mutex. Every mutating operation (add, remove, chat turn) holds that
//! mutex for its whole duration, so one user's operations run one at a time
//! in arrival order while different users proceed in parallel.
//!
//! Reads do not queue behind that mutex: every change to the guarded
//! handles is republished as a [`LiveView`] that listing and catalog calls
//! copy without locking.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::mcp_client::ToolBackend;

// ─── Backends ────────────────────────────────────────────────────────────────

/// A live handle plus the name it is listed under.
#[derive(Clone)]
pub struct BackendEntry {
    pub handle: Arc<dyn ToolBackend>,
    pub display_name: String,
}

/// What readers see of a session without taking its lock.
#[derive(Clone, Default)]
pub enum LiveView {
    /// Backends are still being restored; readers must wait for the lock.
    #[default]
    Restoring,
    Ready(BTreeMap<String, BackendEntry>),
    Closed,
}

/// The state guarded by a session's lock.
pub struct SessionBackends {
    handles: BTreeMap<String, BackendEntry>,
    closed: bool,
    restored: bool,
    view: Arc<StdMutex<LiveView>>,
}

impl SessionBackends {
    fn new(view: Arc<StdMutex<LiveView>>) -> Self {
        Self {
            handles: BTreeMap::new(),
            closed: false,
            restored: false,
            view,
        }
    }

    /// Set once the session has been evicted; a closed session accepts no
    /// further work.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn contains(&self, backend_id: &str) -> bool {
        self.handles.contains_key(backend_id)
    }

    pub fn get(&self, backend_id: &str) -> Option<&BackendEntry> {
        self.handles.get(backend_id)
    }

    pub fn insert(&mut self, backend_id: &str, entry: BackendEntry) {
        self.handles.insert(backend_id.to_string(), entry);
        self.publish();
    }

    pub fn remove(&mut self, backend_id: &str) -> Option<BackendEntry> {
        let removed = self.handles.remove(backend_id);
        self.publish();
        removed
    }

    /// Restoration is over; the handles may now be read without the lock.
    pub fn mark_restored(&mut self) {
        self.restored = true;
        self.publish();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BackendEntry)> {
        self.handles.iter()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn publish(&self) {
        let view = if self.closed {
            LiveView::Closed
        } else if self.restored {
            LiveView::Ready(self.handles.clone())
        } else {
            LiveView::Restoring
        };
        *self.view.lock().unwrap_or_else(|e| e.into_inner()) = view;
    }
}

// ─── UserSession ─────────────────────────────────────────────────────────────

pub struct UserSession {
    user_id: String,
    session_id: String,
    created_at: DateTime<Utc>,
    last_active: StdMutex<Instant>,
    identity: StdMutex<BTreeMap<String, String>>,
    backends: Arc<Mutex<SessionBackends>>,
    view: Arc<StdMutex<LiveView>>,
}

impl UserSession {
    pub fn new(user_id: &str) -> Self {
        let view = Arc::new(StdMutex::new(LiveView::default()));
        Self {
            user_id: user_id.to_string(),
            session_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            last_active: StdMutex::new(Instant::now()),
            identity: StdMutex::new(BTreeMap::new()),
            backends: Arc::new(Mutex::new(SessionBackends::new(Arc::clone(&view)))),
            view,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Diagnostic id, new for every session object.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Replace identity metadata captured from the request (headers, claims).
    pub fn set_identity(&self, identity: BTreeMap<String, String>) {
        *self.identity.lock().unwrap_or_else(|e| e.into_inner()) = identity;
    }

    pub fn identity(&self) -> BTreeMap<String, String> {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Latest published state of the backends, without waiting for the lock.
    pub fn live_view(&self) -> LiveView {
        self.touch();
        self.view.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wait for exclusive access to this session's backends.
    pub async fn lock(&self) -> OwnedMutexGuard<SessionBackends> {
        self.touch();
        let guard = Arc::clone(&self.backends).lock_owned().await;
        self.touch();
        guard
    }

    /// Exclusive access if nobody holds the session right now.
    pub(crate) fn try_lock(&self) -> Option<OwnedMutexGuard<SessionBackends>> {
        Arc::clone(&self.backends).try_lock_owned().ok()
    }

    /// Mark closed and disconnect every handle concurrently.
    ///
    /// Waits for any in-flight operation on this session first. Returns the
    /// number of handles released.
    pub async fn close(&self) -> usize {
        let mut guard = self.lock().await;
        guard.closed = true;
        let handles = std::mem::take(&mut guard.handles);
        guard.publish();
        let count = handles.len();
        join_all(
            handles
                .into_values()
                .map(|entry| async move { entry.handle.disconnect().await }),
        )
        .await;
        tracing::info!(
            user_id = %self.user_id,
            session_id = %self.session_id,
            backends = count,
            "session closed"
        );
        count
    }
}
