//! MCP streamable HTTP transport.
//!
//! Every JSON-RPC message is POSTed to a single endpoint. The server answers
//! a request either with a plain JSON body or with an SSE stream carrying
//! the response (possibly after server-initiated messages). The session id
//! issued during `initialize` is echoed on every later call and released
//! with a DELETE when the transport shuts down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};

use super::config::HttpConfig;
use super::errors::McpError;
use super::transport::next_request_id;
use super::types::{error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Bound on the best-effort session DELETE at shutdown.
const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Characters of an error body kept in error messages.
const ERROR_BODY_MAX_CHARS: usize = 500;

// ─── Transport ───────────────────────────────────────────────────────────────

/// JSON-RPC transport over MCP streamable HTTP.
pub struct HttpTransport {
    server_name: String,
    endpoint: String,
    client: reqwest::Client,
    read_timeout: Duration,
    session_id: StdMutex<Option<String>>,
    protocol_version: StdMutex<Option<String>>,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Build a transport for `config`. No network traffic happens here.
    pub fn new(server_name: &str, config: &HttpConfig) -> Result<Self, McpError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.http_headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| McpError::ConfigError {
                reason: format!("invalid header name '{key}': {e}"),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| McpError::ConfigError {
                reason: format!("invalid value for header '{key}': {e}"),
            })?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| McpError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_name: server_name.to_string(),
            endpoint: config.server_url.trim().to_string(),
            client,
            read_timeout: config.read_timeout(),
            session_id: StdMutex::new(None),
            protocol_version: StdMutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record the negotiated protocol version; sent on subsequent requests.
    pub fn set_protocol_version(&self, version: &str) {
        *self
            .protocol_version
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(version.to_string());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a JSON-RPC request and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.is_closed() {
            return Err(self.transport_error("transport is closed"));
        }

        let id = next_request_id();
        let response = self.post(&JsonRpcRequest::new(id, method, params)).await?;
        let response = self.check_status(response).await?;

        if is_event_stream(&response) {
            self.read_event_stream(response, id).await
        } else {
            let body: Value = tokio::time::timeout(self.read_timeout, response.json::<Value>())
                .await
                .map_err(|_| self.transport_error("timed out reading response body"))?
                .map_err(|e| self.protocol_error(format!("invalid JSON response: {e}")))?;
            find_response(&body, id).ok_or_else(|| {
                self.protocol_error(format!("no response for request {id} in body"))
            })
        }
    }

    /// Send a JSON-RPC notification; the server acknowledges with 202.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.transport_error("transport is closed"));
        }
        let response = self.post(&JsonRpcNotification::new(method, params)).await?;
        self.check_status(response).await.map(|_| ())
    }

    /// Mark closed and release the server-side session.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let session_id = self
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session_id) = session_id {
            let request = self
                .client
                .delete(&self.endpoint)
                .header(SESSION_HEADER, &session_id)
                .timeout(DELETE_TIMEOUT);
            match request.send().await {
                Ok(resp) => {
                    tracing::debug!(server = %self.server_name, status = %resp.status(), "released HTTP session");
                }
                Err(e) => {
                    tracing::debug!(server = %self.server_name, error = %e, "session release failed");
                }
            }
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────

    async fn post<T: Serialize>(&self, message: &T) -> Result<reqwest::Response, McpError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .json(message);

        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_HEADER, session_id);
        }
        let version = self
            .protocol_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(version) = version {
            request = request.header(PROTOCOL_VERSION_HEADER, version);
        }

        let response = tokio::time::timeout(self.read_timeout, request.send())
            .await
            .map_err(|_| {
                self.transport_error(format!(
                    "no response from {} within {}s",
                    self.endpoint,
                    self.read_timeout.as_secs()
                ))
            })?
            .map_err(|e| self.transport_error(format!("request to {} failed: {e}", self.endpoint)))?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
            if current.as_deref() != Some(session_id) {
                *current = Some(session_id.to_string());
            }
        }

        Ok(response)
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response, McpError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND && self.session_id().is_some() {
            return Err(self.transport_error("server session expired (404)"));
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_MAX_CHARS {
            let mut cut = ERROR_BODY_MAX_CHARS;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(self.transport_error(format!("HTTP {status}: {}", body.trim())))
    }

    /// Read SSE events until the response for `id` arrives.
    ///
    /// Chunks are buffered as raw bytes; an event is decoded only once its
    /// terminating blank line has arrived.
    async fn read_event_stream(
        &self,
        response: reqwest::Response,
        id: u64,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            while let Some((event_end, separator)) = find_event_boundary(&buffer) {
                let raw: Vec<u8> = buffer.drain(..event_end + separator).take(event_end).collect();
                if let Some(found) = self.handle_raw_event(raw, id).await {
                    return Ok(found);
                }
            }

            match tokio::time::timeout(self.read_timeout, stream.next()).await {
                Err(_) => {
                    return Err(self.transport_error(format!(
                        "no event within {}s while waiting for request {id}",
                        self.read_timeout.as_secs()
                    )));
                }
                Ok(Some(Ok(bytes))) => buffer.extend_from_slice(&bytes),
                Ok(Some(Err(e))) => {
                    return Err(self.transport_error(format!("stream read error: {e}")));
                }
                Ok(None) => {
                    if let Some(found) = self.handle_raw_event(buffer, id).await {
                        return Ok(found);
                    }
                    return Err(self.protocol_error(format!(
                        "event stream ended before response to request {id}"
                    )));
                }
            }
        }
    }

    async fn handle_raw_event(&self, raw: Vec<u8>, id: u64) -> Option<JsonRpcResponse> {
        match String::from_utf8(raw) {
            Ok(event) => self.handle_event(event.trim(), id).await,
            Err(e) => {
                tracing::debug!(server = %self.server_name, error = %e, "ignoring non-UTF-8 event");
                None
            }
        }
    }

    /// Route one SSE event. Returns the response for `id` when it is in it.
    async fn handle_event(&self, event: &str, id: u64) -> Option<JsonRpcResponse> {
        let data = parse_sse_event(event)?;
        let message: Value = match serde_json::from_str(&data) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(server = %self.server_name, error = %e, "ignoring non-JSON event");
                return None;
            }
        };

        let messages = match message {
            Value::Array(batch) => batch,
            single => vec![single],
        };
        let mut found = None;
        for message in messages {
            if let Some(response) = JsonRpcResponse::from_message(&message) {
                if response.id == id {
                    found = Some(response);
                }
                continue;
            }
            self.answer_server_request(&message).await;
        }
        found
    }

    async fn answer_server_request(&self, message: &Value) {
        let (Some(method), Some(id)) = (
            message.get("method").and_then(Value::as_str),
            message.get("id").cloned(),
        ) else {
            return;
        };
        let reply = if method == "ping" {
            json!({"jsonrpc": "2.0", "id": id, "result": {}})
        } else {
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": error_codes::METHOD_NOT_FOUND,
                    "message": format!("method not supported by client: {method}"),
                }
            })
        };
        if let Err(e) = self.post(&reply).await {
            tracing::debug!(server = %self.server_name, method, error = %e, "failed to answer server request");
        }
    }

    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    fn protocol_error(&self, reason: impl Into<String>) -> McpError {
        McpError::ProtocolError {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let session_id = self
            .session_id
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let (Some(session_id), Ok(runtime)) =
            (session_id, tokio::runtime::Handle::try_current())
        else {
            return;
        };
        let request = self
            .client
            .delete(&self.endpoint)
            .header(SESSION_HEADER, session_id)
            .timeout(DELETE_TIMEOUT);
        runtime.spawn(async move {
            let _ = request.send().await;
        });
    }
}

// ─── Parsing Helpers ─────────────────────────────────────────────────────────

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false)
}

/// Locate the first blank line in `buf`. Returns where the event before it
/// ends and how many separator bytes follow.
fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    buf.iter().enumerate().find_map(|(i, &byte)| {
        if byte != b'\n' {
            return None;
        }
        let rest = &buf[i + 1..];
        if rest.starts_with(b"\n") {
            Some((i, 2))
        } else if rest.starts_with(b"\r\n") {
            Some((i, 3))
        } else {
            None
        }
    })
}

/// Join the `data:` lines of one SSE event. `None` for comments and
/// keep-alives.
pub(crate) fn parse_sse_event(event: &str) -> Option<String> {
    let data: Vec<&str> = event
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            line.strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
        })
        .collect();
    let joined = data.join("\n");
    if joined.trim().is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Locate the response for `id` in a JSON body (single message or batch).
fn find_response(body: &Value, id: u64) -> Option<JsonRpcResponse> {
    match body {
        Value::Array(batch) => batch
            .iter()
            .filter_map(JsonRpcResponse::from_message)
            .find(|r| r.id == id),
        single => JsonRpcResponse::from_message(single).filter(|r| r.id == id),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
