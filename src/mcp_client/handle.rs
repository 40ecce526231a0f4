//! Tool backend handles.
//!
//! A [`BackendHandle`] owns exactly one connection to one backend, over
//! either transport. It moves through
//! `Disconnected -> Connecting -> Ready | Failed` once; a failed connect is
//! terminal and callers build a fresh handle to retry. Transport resources
//! are owned by the handle and released by [`ToolBackend::disconnect`] or,
//! failing that, when the handle is dropped (child processes are spawned
//! with kill-on-drop, HTTP sessions are released from `Drop`).

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use super::config::{BackendConfig, TransportConfig, TransportKind};
use super::errors::McpError;
use super::http_transport::HttpTransport;
use super::transport::{extract_result, StdioTransport};
use super::types::{InitializeResult, ListToolsResult, ToolResult, ToolSpec, PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default bound on the subprocess handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a single tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Guard against backends that keep returning a cursor.
const MAX_TOOL_PAGES: usize = 100;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a backend handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendState::Disconnected => "disconnected",
            BackendState::Connecting => "connecting",
            BackendState::Ready => "ready",
            BackendState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Uniform surface over a connected backend, whatever its transport.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TransportKind;

    fn state(&self) -> BackendState;

    /// Catalog captured at connect time.
    fn tools(&self) -> Vec<ToolSpec>;

    /// Query the backend for its current catalog.
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, McpError>;

    /// Call `tool_name` with `arguments`.
    async fn invoke(&self, tool_name: &str, arguments: Value) -> Result<ToolResult, McpError>;

    /// Release transport resources. Idempotent and time-bounded.
    async fn disconnect(&self);
}

/// Builds connected backends from configuration.
///
/// The seam lets session and facade code run against fakes in tests.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        backend_id: &str,
        config: &BackendConfig,
    ) -> Result<Arc<dyn ToolBackend>, McpError>;
}

// ─── Transport ───────────────────────────────────────────────────────────────

enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl Transport {
    fn open(backend_id: &str, config: &TransportConfig) -> Result<Self, McpError> {
        match config {
            TransportConfig::Subprocess(sub) => {
                StdioTransport::spawn(backend_id, sub).map(Transport::Stdio)
            }
            TransportConfig::HttpStream(http) => {
                HttpTransport::new(backend_id, http).map(Transport::Http)
            }
        }
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let response = match self {
            Transport::Stdio(t) => t.request(method, params).await?,
            Transport::Http(t) => t.request(method, params).await?,
        };
        extract_result(response)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        match self {
            Transport::Stdio(t) => t.notify(method, params).await,
            Transport::Http(t) => t.notify(method, params).await,
        }
    }

    async fn shutdown(&self) {
        match self {
            Transport::Stdio(t) => t.shutdown().await,
            Transport::Http(t) => t.shutdown().await,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Transport::Stdio(t) => t.is_closed(),
            Transport::Http(t) => t.is_closed(),
        }
    }

    fn stderr_tail(&self) -> String {
        match self {
            Transport::Stdio(t) => t.stderr_tail(),
            Transport::Http(_) => String::new(),
        }
    }
}

// ─── BackendHandle ───────────────────────────────────────────────────────────

/// One live connection to one backend.
pub struct BackendHandle {
    id: String,
    config: BackendConfig,
    call_timeout: Duration,
    state: StdMutex<BackendState>,
    transport: StdMutex<Option<Arc<Transport>>>,
    tools: OnceLock<Vec<ToolSpec>>,
}

impl BackendHandle {
    pub fn new(id: &str, config: BackendConfig, call_timeout: Duration) -> Self {
        Self {
            id: id.to_string(),
            config,
            call_timeout,
            state: StdMutex::new(BackendState::Disconnected),
            transport: StdMutex::new(None),
            tools: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Open the transport and run the MCP handshake within `timeout`.
    ///
    /// On any failure the partially opened transport is shut down before
    /// returning and the handle is left `Failed`.
    pub async fn connect(&self, timeout: Duration) -> Result<(), McpError> {
        {
            let mut state = self.lock_state();
            if *state != BackendState::Disconnected || self.tools.get().is_some() {
                return Err(McpError::NotConnected {
                    name: self.id.clone(),
                    state: state.to_string(),
                });
            }
            *state = BackendState::Connecting;
        }

        let started = Instant::now();
        let transport = match Transport::open(&self.id, &self.config.transport) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                self.set_state(BackendState::Failed);
                tracing::warn!(backend = %self.id, error = %e, "failed to open backend transport");
                return Err(e);
            }
        };

        match tokio::time::timeout(timeout, handshake(&transport, &self.id)).await {
            Ok(Ok(tools)) => {
                let tool_count = tools.len();
                let _ = self.tools.set(tools);
                *self.lock_transport() = Some(transport);
                self.set_state(BackendState::Ready);
                tracing::info!(
                    backend = %self.id,
                    kind = ?self.config.kind(),
                    tools = tool_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "backend connected"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let e = attach_stderr(e, &transport.stderr_tail());
                transport.shutdown().await;
                self.set_state(BackendState::Failed);
                tracing::warn!(backend = %self.id, error = %e, "backend handshake failed");
                Err(e)
            }
            Err(_) => {
                transport.shutdown().await;
                self.set_state(BackendState::Failed);
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!(backend = %self.id, timeout_ms, "backend handshake timed out");
                Err(McpError::ConnectTimeout {
                    name: self.id.clone(),
                    timeout_ms,
                })
            }
        }
    }

    fn ready_transport(&self) -> Result<Arc<Transport>, McpError> {
        let state = self.state();
        let transport = self.lock_transport().clone();
        match (state, transport) {
            (BackendState::Ready, Some(t)) => Ok(t),
            (state, _) => Err(McpError::NotConnected {
                name: self.id.clone(),
                state: state.to_string(),
            }),
        }
    }

    /// Flip to `Failed` if the transport died underneath a request.
    fn note_transport_failure(&self, transport: &Transport) {
        if transport.is_closed() {
            let mut state = self.lock_state();
            if *state == BackendState::Ready {
                *state = BackendState::Failed;
                tracing::warn!(backend = %self.id, "backend transport closed");
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: BackendState) {
        *self.lock_state() = next;
    }

    fn lock_transport(&self) -> std::sync::MutexGuard<'_, Option<Arc<Transport>>> {
        self.transport.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ToolBackend for BackendHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        self.config.kind()
    }

    fn state(&self) -> BackendState {
        *self.lock_state()
    }

    fn tools(&self) -> Vec<ToolSpec> {
        self.tools.get().cloned().unwrap_or_default()
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, McpError> {
        let transport = self.ready_transport()?;
        let result = fetch_tools(&transport, &self.id).await;
        if result.is_err() {
            self.note_transport_failure(&transport);
        }
        result
    }

    async fn invoke(&self, tool_name: &str, arguments: Value) -> Result<ToolResult, McpError> {
        let transport = self.ready_transport()?;
        let params = json!({ "name": tool_name, "arguments": arguments });
        let started = Instant::now();

        let raw = match tokio::time::timeout(
            self.call_timeout,
            transport.request("tools/call", Some(params)),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(McpError::ServerError { code, message, .. })) => {
                return Err(McpError::ToolInvocation {
                    tool: tool_name.to_string(),
                    reason: format!("[{code}] {message}"),
                });
            }
            Ok(Err(e)) => {
                self.note_transport_failure(&transport);
                return Err(e);
            }
            Err(_) => {
                return Err(McpError::Timeout {
                    tool: tool_name.to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                });
            }
        };

        let result = ToolResult::from_value(&raw).ok_or_else(|| McpError::ToolInvocation {
            tool: tool_name.to_string(),
            reason: "backend returned an empty result".into(),
        })?;

        tracing::debug!(
            backend = %self.id,
            tool = tool_name,
            is_error = result.is_error,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool call completed"
        );
        Ok(result)
    }

    async fn disconnect(&self) {
        let transport = self.lock_transport().take();
        if let Some(transport) = transport {
            transport.shutdown().await;
            tracing::info!(backend = %self.id, "backend disconnected");
        }
        let mut state = self.lock_state();
        if *state != BackendState::Failed {
            *state = BackendState::Disconnected;
        }
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// `initialize`, `notifications/initialized`, then the full tool catalog.
async fn handshake(transport: &Transport, backend_id: &str) -> Result<Vec<ToolSpec>, McpError> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let raw = transport
        .request("initialize", Some(params))
        .await
        .map_err(|e| match e {
            McpError::ServerError { code, message, .. } => McpError::InitFailed {
                name: backend_id.to_string(),
                reason: format!("initialize rejected [{code}]: {message}"),
            },
            other => other,
        })?;

    let init: InitializeResult = serde_json::from_value(raw).map_err(|e| McpError::InitFailed {
        name: backend_id.to_string(),
        reason: format!("failed to parse initialize response: {e}"),
    })?;

    if let Transport::Http(http) = transport {
        http.set_protocol_version(init.protocol_version.as_deref().unwrap_or(PROTOCOL_VERSION));
    }
    tracing::debug!(
        backend = backend_id,
        server = ?init.server_info.as_ref().and_then(|s| s.name.as_deref()),
        protocol = ?init.protocol_version,
        "initialize complete"
    );

    transport.notify("notifications/initialized", None).await?;
    fetch_tools(transport, backend_id).await
}

/// Page through `tools/list` until no cursor is returned.
async fn fetch_tools(transport: &Transport, backend_id: &str) -> Result<Vec<ToolSpec>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let raw = transport.request("tools/list", params).await?;
        let page: ListToolsResult =
            serde_json::from_value(raw).map_err(|e| McpError::ProtocolError {
                server: backend_id.to_string(),
                reason: format!("malformed tools/list result: {e}"),
            })?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next);
            }
            _ => return Ok(tools),
        }
    }

    Err(McpError::ProtocolError {
        server: backend_id.to_string(),
        reason: format!("tools/list did not finish within {MAX_TOOL_PAGES} pages"),
    })
}

fn attach_stderr(error: McpError, tail: &str) -> McpError {
    if tail.is_empty() {
        return error;
    }
    match error {
        McpError::InitFailed { name, reason } if !reason.contains("stderr:") => McpError::InitFailed {
            name,
            reason: format!("{reason} | stderr: {tail}"),
        },
        other => other,
    }
}

// ─── TransportConnector ──────────────────────────────────────────────────────

/// Connects real stdio and HTTP backends.
#[derive(Debug, Clone)]
pub struct TransportConnector {
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl TransportConnector {
    pub fn new(connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            call_timeout,
        }
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_CALL_TIMEOUT)
    }
}

#[async_trait]
impl BackendConnector for TransportConnector {
    async fn connect(
        &self,
        backend_id: &str,
        config: &BackendConfig,
    ) -> Result<Arc<dyn ToolBackend>, McpError> {
        let timeout = match &config.transport {
            TransportConfig::HttpStream(http) => http.request_timeout(),
            TransportConfig::Subprocess(_) => self.connect_timeout,
        };
        let handle = BackendHandle::new(backend_id, config.clone(), self.call_timeout);
        handle.connect(timeout).await?;
        Ok(Arc::new(handle))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
