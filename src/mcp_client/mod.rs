//! Connections to MCP tool backends.
//!
//! This module handles:
//! - Spawning backend child processes and speaking JSON-RPC over their stdio
//! - MCP streamable HTTP (JSON and SSE responses, session ids)
//! - The initialize handshake and paginated tool discovery
//! - Tool invocation with best-effort recovery of malformed results
//! - Flattening (backend, tool) pairs into model-safe external ids
//!
//! The gateway's session layer holds one [`BackendHandle`] per backend per
//! user and never shares them across users.

pub mod config;
pub mod errors;
pub mod handle;
pub mod http_transport;
pub mod namespace;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use config::{BackendConfig, HttpConfig, SubprocessConfig, TransportConfig, TransportKind};
pub use errors::McpError;
pub use handle::{BackendConnector, BackendHandle, BackendState, ToolBackend, TransportConnector};
pub use namespace::{ToolNamespace, ToolRef};
pub use types::{ContentBlock, ToolResult, ToolSpec};
