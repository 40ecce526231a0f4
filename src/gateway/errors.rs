//! Gateway error types.

use thiserror::Error;

use crate::mcp_client::McpError;

/// Errors surfaced by the session, config and facade layers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The user already has a backend with this id.
    #[error("backend '{backend_id}' already exists for this user")]
    DuplicateId { backend_id: String },

    /// Backend id or connection config is unusable.
    #[error("invalid backend config: {reason}")]
    InvalidConfig { reason: String },

    /// The backend could not be connected.
    #[error("failed to connect backend '{backend_id}': {source}")]
    Connect {
        backend_id: String,
        #[source]
        source: McpError,
    },

    /// The id is unknown in the caller's scope.
    #[error("backend '{backend_id}' not found")]
    NotFound { backend_id: String },

    /// The backend comes from the global config and cannot be removed per user.
    #[error("backend '{backend_id}' is shared and cannot be removed by a user")]
    SharedBackend { backend_id: String },

    /// Durable store write failed.
    #[error("failed to persist {key}: {reason}")]
    Persistence { key: String, reason: String },

    /// Durable store could not be opened or read.
    #[error("storage error: {reason}")]
    Storage { reason: String },

    /// The chat orchestrator failed mid-turn.
    #[error("chat turn failed: {reason}")]
    Orchestration { reason: String },
}

impl GatewayError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::DuplicateId { .. } => "duplicate_id",
            GatewayError::InvalidConfig { .. } => "invalid_config",
            GatewayError::Connect { .. } => "connect_failed",
            GatewayError::NotFound { .. } => "not_found",
            GatewayError::SharedBackend { .. } => "shared_backend",
            GatewayError::Persistence { .. } => "persistence_failed",
            GatewayError::Storage { .. } => "storage_error",
            GatewayError::Orchestration { .. } => "orchestration_failed",
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Storage {
            reason: e.to_string(),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Storage {
            reason: e.to_string(),
        }
    }
}
