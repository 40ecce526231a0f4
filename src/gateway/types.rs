//! Shared types for the gateway facade.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::errors::GatewayError;
use crate::mcp_client::config::{
    HttpConfig, SubprocessConfig, DEFAULT_HTTP_READ_TIMEOUT_SECS, DEFAULT_HTTP_TIMEOUT_SECS,
};
use crate::mcp_client::{
    BackendConfig, BackendState, ToolNamespace, ToolSpec, TransportConfig, TransportKind,
};

// ─── Listing ─────────────────────────────────────────────────────────────────

/// One row of a user's backend list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendSummary {
    pub id: String,
    pub display_name: String,
    /// State of this user's handle; `None` when no handle is live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<BackendState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransportKind>,
    /// Comes from the global config rather than this user's own entries.
    pub shared: bool,
}

/// Who the gateway thinks the caller is, plus their session.
#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub user_id: String,
    pub session_id: String,
    pub session_created_at: DateTime<Utc>,
    pub live_backends: usize,
    pub identity: BTreeMap<String, String>,
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// A backend tool as presented to a model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogTool {
    /// Namespaced external id.
    pub name: String,
    /// Name the backend knows the tool by.
    pub raw_name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCatalog {
    pub backend_id: String,
    pub tools: Vec<CatalogTool>,
}

impl ToolCatalog {
    /// Namespace `tools` under `backend_id`, registering each external id.
    pub fn build(backend_id: &str, tools: &[ToolSpec], namespace: &ToolNamespace) -> Self {
        let tools = tools
            .iter()
            .map(|spec| CatalogTool {
                name: namespace.external_id(backend_id, &spec.name),
                raw_name: spec.name.clone(),
                description: spec
                    .description
                    .clone()
                    .unwrap_or_else(|| spec.name.clone()),
                input_schema: spec.input_schema.clone(),
            })
            .collect();
        Self {
            backend_id: backend_id.to_string(),
            tools,
        }
    }

    /// Bedrock Converse `toolConfig` shape.
    pub fn to_bedrock_tool_config(&self) -> Value {
        bedrock_tool_config(&self.tools)
    }
}

/// Render any set of catalog tools as a Bedrock Converse `toolConfig`.
pub fn bedrock_tool_config(tools: &[CatalogTool]) -> Value {
    let specs: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "toolSpec": {
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": {"json": tool.input_schema},
                }
            })
        })
        .collect();
    json!({ "tools": specs })
}

// ─── Add request ─────────────────────────────────────────────────────────────

/// Body of an add-backend call.
///
/// Either flat fields (`backend_id` plus `command`/`args`/`env` or
/// `server_url`/`http_headers`/`http_timeout`) or a structured
/// `config_json` of the form `{"<id>": {...}}`, optionally wrapped in
/// `mcpServers`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddBackendRequest {
    #[serde(default, alias = "server_id")]
    pub backend_id: Option<String>,
    #[serde(default, alias = "server_desc")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub config_json: Option<Value>,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub http_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub http_timeout: Option<u64>,
}

impl AddBackendRequest {
    /// Resolve the backend id and connection config this request describes.
    pub fn resolve(&self) -> Result<(String, BackendConfig), GatewayError> {
        let explicit_id = non_empty(&self.backend_id);
        if let Some(id) = explicit_id {
            validate_backend_id(id)?;
        }

        let (id, mut config) = match self.structured_config()? {
            Some(entries) => pick_structured_entry(entries, explicit_id)?,
            None => {
                let id = explicit_id.ok_or_else(|| GatewayError::InvalidConfig {
                    reason: "backend_id is required without config_json".into(),
                })?;
                (id.to_string(), self.flat_config()?)
            }
        };

        if let Some(name) = non_empty(&self.display_name) {
            config.description = Some(name.to_string());
        }
        Ok((id, config))
    }

    /// `config_json` as an object of entries, unwrapping `mcpServers`.
    fn structured_config(&self) -> Result<Option<serde_json::Map<String, Value>>, GatewayError> {
        let raw = match &self.config_json {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
            Some(Value::String(s)) => {
                serde_json::from_str::<Value>(s).map_err(|e| GatewayError::InvalidConfig {
                    reason: format!("config_json is not valid JSON: {e}"),
                })?
            }
            Some(other) => other.clone(),
        };

        let raw = match raw {
            Value::Object(mut obj) => match obj.remove("mcpServers") {
                Some(Value::Object(inner)) => inner,
                Some(_) => {
                    return Err(GatewayError::InvalidConfig {
                        reason: "mcpServers must be an object".into(),
                    })
                }
                None => obj,
            },
            _ => {
                return Err(GatewayError::InvalidConfig {
                    reason: "config_json must be an object".into(),
                })
            }
        };
        Ok(Some(raw))
    }

    fn flat_config(&self) -> Result<BackendConfig, GatewayError> {
        let transport = if let Some(url) = non_empty(&self.server_url) {
            TransportConfig::HttpStream(HttpConfig {
                server_url: url.to_string(),
                http_headers: self.http_headers.clone().unwrap_or_default(),
                http_timeout: self.http_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
                http_read_timeout: DEFAULT_HTTP_READ_TIMEOUT_SECS,
            })
        } else if let Some(command) = non_empty(&self.command) {
            TransportConfig::Subprocess(SubprocessConfig {
                command: command.to_string(),
                args: self.args.clone(),
                env: self.env.clone().unwrap_or_default(),
                cwd: non_empty(&self.cwd).map(str::to_string),
            })
        } else {
            return Err(GatewayError::InvalidConfig {
                reason: "either command or server_url is required".into(),
            });
        };
        Ok(BackendConfig {
            description: None,
            transport,
        })
    }
}

/// Choose the entry to add from a structured config.
///
/// A single entry is used as is. With several, the explicit id selects one.
fn pick_structured_entry(
    mut entries: serde_json::Map<String, Value>,
    explicit_id: Option<&str>,
) -> Result<(String, BackendConfig), GatewayError> {
    let id = match (entries.len(), explicit_id) {
        (0, _) => {
            return Err(GatewayError::InvalidConfig {
                reason: "config_json has no server entries".into(),
            })
        }
        (1, None) => entries.keys().next().cloned().unwrap_or_default(),
        (_, Some(id)) if entries.contains_key(id) => id.to_string(),
        (1, Some(id)) => {
            // Single entry renamed to the explicit id.
            let value = entries.values().next().cloned().unwrap_or(Value::Null);
            entries.clear();
            entries.insert(id.to_string(), value);
            id.to_string()
        }
        (_, _) => {
            return Err(GatewayError::InvalidConfig {
                reason: "config_json has several servers; name one with backend_id".into(),
            })
        }
    };

    if id.trim().is_empty() {
        return Err(GatewayError::InvalidConfig {
            reason: "config_json server id must not be empty".into(),
        });
    }
    let value = entries.remove(&id).unwrap_or(Value::Null);
    let config = serde_json::from_value::<BackendConfig>(value).map_err(|e| {
        GatewayError::InvalidConfig {
            reason: format!("config for '{id}' is not a valid server entry: {e}"),
        }
    })?;
    Ok((id, config))
}

/// Ids start with a letter, then letters, digits, `_` or `-`.
pub fn validate_backend_id(id: &str) -> Result<(), GatewayError> {
    let mut chars = id.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidConfig {
            reason: format!(
                "backend id '{id}' must start with a letter and contain only letters, digits, '_' or '-'"
            ),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
