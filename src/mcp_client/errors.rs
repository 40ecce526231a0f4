//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur while talking to a tool backend.
#[derive(Debug, Error)]
pub enum McpError {
    /// A backend process failed to start.
    #[error("failed to spawn backend '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("backend '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// The connect handshake did not finish within the caller's timeout.
    #[error("connection to backend '{name}' timed out after {timeout_ms}ms")]
    ConnectTimeout {
        name: String,
        timeout_ms: u64,
    },

    /// I/O or HTTP failure on an established transport.
    #[error("transport error for backend '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Backend answered but violated the expected contract.
    #[error("protocol error from backend '{server}': {reason}")]
    ProtocolError {
        server: String,
        reason: String,
    },

    /// Backend returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A tool call returned a result that could not be recovered.
    #[error("tool call '{tool}' failed: {reason}")]
    ToolInvocation {
        tool: String,
        reason: String,
    },

    /// External tool id did not resolve to a live backend.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout {
        tool: String,
        timeout_ms: u64,
    },

    /// Operation issued against a handle that is not ready.
    #[error("backend '{name}' is not connected (state: {state})")]
    NotConnected {
        name: String,
        state: String,
    },

    /// Invalid connection parameters.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Whether this error means the transport could not be (or is no longer)
    /// established, as opposed to a contract or tool-level failure.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            McpError::SpawnFailed { .. }
                | McpError::InitFailed { .. }
                | McpError::ConnectTimeout { .. }
                | McpError::TransportError { .. }
        )
    }
}
