//! In-process fakes for session and facade tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::mcp_client::{
    BackendConfig, BackendConnector, BackendState, McpError, ToolBackend, ToolResult, ToolSpec,
    TransportKind,
};

/// A backend exposing `search` and `fetch`; calls echo their inputs.
pub struct FakeBackend {
    id: String,
    kind: TransportKind,
    state: StdMutex<BackendState>,
    disconnects: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_counter(id, TransportKind::Subprocess, Arc::new(AtomicUsize::new(0)))
    }

    fn with_counter(id: &str, kind: TransportKind, disconnects: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            state: StdMutex::new(BackendState::Ready),
            disconnects,
        })
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolBackend for FakeBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn state(&self) -> BackendState {
        *self.state.lock().unwrap()
    }

    fn tools(&self) -> Vec<ToolSpec> {
        ["search", "fetch"]
            .into_iter()
            .map(|name| ToolSpec {
                name: name.to_string(),
                description: Some(format!("{name} via {}", self.id)),
                input_schema: json!({"type": "object"}),
            })
            .collect()
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, McpError> {
        Ok(self.tools())
    }

    async fn invoke(&self, tool_name: &str, arguments: Value) -> Result<ToolResult, McpError> {
        if self.state() != BackendState::Ready {
            return Err(McpError::NotConnected {
                name: self.id.clone(),
                state: self.state().to_string(),
            });
        }
        Ok(ToolResult::text(format!("{}:{tool_name}:{arguments}", self.id)))
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != BackendState::Disconnected {
            *state = BackendState::Disconnected;
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Connector producing [`FakeBackend`]s, with counters and failure injection.
#[derive(Default)]
pub struct FakeConnector {
    delay: Duration,
    failing: StdMutex<HashSet<String>>,
    connects: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every connect.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make connects for `backend_id` fail.
    pub fn fail_backend(&self, backend_id: &str) {
        self.failing.lock().unwrap().insert(backend_id.to_string());
    }

    /// Connect attempts so far, failed ones included.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Disconnects across every backend this connector produced.
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for FakeConnector {
    async fn connect(
        &self,
        backend_id: &str,
        config: &BackendConfig,
    ) -> Result<Arc<dyn ToolBackend>, McpError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.lock().unwrap().contains(backend_id) {
            return Err(McpError::InitFailed {
                name: backend_id.to_string(),
                reason: "refused by test".into(),
            });
        }
        let backend: Arc<dyn ToolBackend> =
            FakeBackend::with_counter(backend_id, config.kind(), Arc::clone(&self.disconnects));
        Ok(backend)
    }
}
