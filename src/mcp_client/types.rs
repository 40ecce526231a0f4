//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
///
/// Field order matters for line-oriented peers: `id` is serialized before
/// `method`.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Try to read a response out of an arbitrary incoming message.
    ///
    /// Returns `None` for notifications, server-initiated requests, and
    /// anything that is not shaped like a response.
    pub fn from_message(message: &Value) -> Option<Self> {
        let obj = message.as_object()?;
        if obj.contains_key("method") {
            return None;
        }
        if !obj.contains_key("result") && !obj.contains_key("error") {
            return None;
        }
        serde_json::from_value(message.clone()).ok()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// One entry of a backend's tool catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolSpec>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// A single content block inside a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    ResourceLink {
        uri: String,
        #[serde(default)]
        name: Option<String>,
    },
}

/// Result of a `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
    #[serde(
        default,
        rename = "structuredContent",
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,
}

impl ToolResult {
    /// A successful single-text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: false,
            structured_content: None,
        }
    }

    /// Concatenate all text blocks, newline separated.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Parse a raw `tools/call` result, falling back to best-effort recovery
    /// when the envelope does not match the MCP schema.
    ///
    /// Returns `None` only when nothing usable can be reconstructed.
    pub fn from_value(raw: &Value) -> Option<Self> {
        if let Ok(parsed) = serde_json::from_value::<ToolResult>(raw.clone()) {
            return Some(parsed);
        }
        recover_tool_result(raw)
    }
}

/// Rebuild a minimal `ToolResult` from a malformed result envelope.
fn recover_tool_result(raw: &Value) -> Option<ToolResult> {
    match raw {
        Value::Null => None,
        Value::String(s) => Some(ToolResult::text(s.clone())),
        Value::Object(obj) => {
            let is_error = obj
                .get("isError")
                .or_else(|| obj.get("is_error"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let structured_content = obj
                .get("structuredContent")
                .filter(|v| !v.is_null())
                .cloned();

            let content = match obj.get("content") {
                Some(Value::Array(items)) => items.iter().map(recover_block).collect(),
                Some(Value::Null) | None => match (obj.get("text"), &structured_content) {
                    (Some(Value::String(text)), _) => {
                        vec![ContentBlock::Text { text: text.clone() }]
                    }
                    (_, Some(structured)) => vec![ContentBlock::Text {
                        text: structured.to_string(),
                    }],
                    _ => vec![ContentBlock::Text {
                        text: raw.to_string(),
                    }],
                },
                Some(single) => vec![recover_block(single)],
            };

            Some(ToolResult {
                content,
                is_error,
                structured_content,
            })
        }
        other => Some(ToolResult::text(other.to_string())),
    }
}

fn recover_block(item: &Value) -> ContentBlock {
    if let Ok(block) = serde_json::from_value::<ContentBlock>(item.clone()) {
        return block;
    }
    match item {
        Value::String(s) => ContentBlock::Text { text: s.clone() },
        Value::Object(obj) => match obj.get("text").and_then(Value::as_str) {
            Some(text) => ContentBlock::Text {
                text: text.to_string(),
            },
            None => ContentBlock::Text {
                text: item.to_string(),
            },
        },
        other => ContentBlock::Text {
            text: other.to_string(),
        },
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_id_before_method() {
        let req = JsonRpcRequest::new(7, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.starts_with(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list""#));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_from_message_skips_requests_and_notifications() {
        let ping = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        assert!(JsonRpcResponse::from_message(&ping).is_none());

        let log = json!({"jsonrpc": "2.0", "method": "notifications/message"});
        assert!(JsonRpcResponse::from_message(&log).is_none());

        let ok = json!({"jsonrpc": "2.0", "id": 3, "result": {}});
        assert_eq!(JsonRpcResponse::from_message(&ok).unwrap().id, 3);
    }

    #[test]
    fn test_tool_spec_defaults_schema() {
        let spec: ToolSpec = serde_json::from_value(json!({"name": "search"})).unwrap();
        assert_eq!(spec.description, None);
        assert_eq!(spec.input_schema["type"], "object");
    }

    #[test]
    fn test_tool_result_well_formed() {
        let raw = json!({
            "content": [{"type": "text", "text": "hello"}],
            "isError": false
        });
        let result = ToolResult::from_value(&raw).unwrap();
        assert_eq!(result.text_content(), "hello");
        assert!(!result.is_error);
    }

    #[test]
    fn test_tool_result_recovers_unknown_block_types() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "ok"},
                {"type": "mystery", "text": "still text"},
                "bare string",
                {"weird": 1}
            ],
            "isError": true
        });
        let result = ToolResult::from_value(&raw).unwrap();
        assert!(result.is_error);
        assert_eq!(result.content.len(), 4);
        assert_eq!(
            result.content[1],
            ContentBlock::Text {
                text: "still text".into()
            }
        );
        assert_eq!(
            result.content[2],
            ContentBlock::Text {
                text: "bare string".into()
            }
        );
    }

    #[test]
    fn test_tool_result_recovers_structured_only() {
        let raw = json!({"structuredContent": {"temp": 21}});
        let result = ToolResult::from_value(&raw).unwrap();
        assert_eq!(result.structured_content, Some(json!({"temp": 21})));
        assert!(result.text_content().contains("21"));
    }

    #[test]
    fn test_tool_result_recovers_scalars() {
        assert_eq!(
            ToolResult::from_value(&json!("plain")).unwrap().text_content(),
            "plain"
        );
        assert_eq!(
            ToolResult::from_value(&json!(42)).unwrap().text_content(),
            "42"
        );
        assert!(ToolResult::from_value(&Value::Null).is_none());
    }
}
