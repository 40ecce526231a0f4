//! Chat turn seam.
//!
//! Model invocation lives outside the gateway. An orchestrator drives one
//! turn against a model and calls back into [`ToolInvoker`] whenever the
//! model asks for a tool; progress is streamed as [`ChatEvent`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::errors::GatewayError;
use super::types::{bedrock_tool_config, CatalogTool};
use crate::mcp_client::{McpError, ToolBackend, ToolNamespace, ToolResult};

/// One chat turn as submitted by a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatTurnRequest {
    pub model: String,
    pub messages: Vec<Value>,
    /// Backends whose tools the model may use; empty means all live ones.
    #[serde(default, alias = "mcp_server_ids")]
    pub backend_ids: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Provider-specific options passed through untouched.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Streamed progress of a chat turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    MessageStart { session_id: String },
    TextDelta { text: String },
    ReasoningDelta { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { id: String, name: String, result: ToolResult },
    MessageStop { stop_reason: String },
    Error { message: String },
}

/// Resolves external tool ids and calls the owning backend.
///
/// Only backends that were live in the session when the turn started are
/// reachable.
#[derive(Clone)]
pub struct ToolInvoker {
    namespace: Arc<ToolNamespace>,
    handles: BTreeMap<String, Arc<dyn ToolBackend>>,
}

impl ToolInvoker {
    pub fn new(
        namespace: Arc<ToolNamespace>,
        handles: BTreeMap<String, Arc<dyn ToolBackend>>,
    ) -> Self {
        Self { namespace, handles }
    }

    pub async fn invoke(&self, external_id: &str, arguments: Value) -> Result<ToolResult, McpError> {
        let unknown = || McpError::UnknownTool {
            name: external_id.to_string(),
        };
        let tool = self.namespace.resolve(external_id).ok_or_else(unknown)?;
        let handle = self.handles.get(&tool.backend_id).ok_or_else(unknown)?;

        tracing::debug!(
            backend = %tool.backend_id,
            tool = %tool.tool_name,
            external_id,
            "invoking tool"
        );
        handle.invoke(&tool.tool_name, arguments).await
    }
}

/// Everything an orchestrator gets for one turn.
pub struct TurnContext {
    pub user_id: String,
    pub session_id: String,
    /// Namespaced tools of the requested backends.
    pub tools: Vec<CatalogTool>,
    pub invoker: ToolInvoker,
}

impl TurnContext {
    /// Bedrock Converse `toolConfig`, or `None` when no tools are offered.
    pub fn bedrock_tool_config(&self) -> Option<Value> {
        (!self.tools.is_empty()).then(|| bedrock_tool_config(&self.tools))
    }
}

/// Drives one model turn with tool use.
#[async_trait]
pub trait ChatOrchestrator: Send + Sync {
    async fn run_turn(
        &self,
        request: ChatTurnRequest,
        context: TurnContext,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<(), GatewayError>;
}
