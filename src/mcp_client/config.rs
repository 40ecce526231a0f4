//! Backend connection configuration.
//!
//! A backend is reached either by spawning a child process that speaks
//! line-delimited JSON-RPC on stdio, or over MCP streamable HTTP. The
//! persisted shape is flat (`command`/`args`/`env` or
//! `server_url`/`http_headers`/`http_timeout`) and also accepts the common
//! `mcpServers` spelling (`url`, `headers`).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default HTTP connect/request timeout (seconds).
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default SSE read timeout (seconds).
pub const DEFAULT_HTTP_READ_TIMEOUT_SECS: u64 = 300;

/// Variables a child process inherits from the gateway's environment.
const INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

/// Cloud credential variables forwarded when present.
const CREDENTIAL_ENV_VARS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_REGION",
];

// ─── Types ───────────────────────────────────────────────────────────────────

/// Which transport a backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Subprocess,
    HttpStream,
}

/// Child process launched with piped stdio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubprocessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// MCP streamable HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(alias = "url")]
    pub server_url: String,
    #[serde(default, alias = "headers")]
    pub http_headers: BTreeMap<String, String>,
    /// Connect/request timeout in seconds.
    #[serde(default = "default_http_timeout", alias = "timeout")]
    pub http_timeout: u64,
    /// Per-chunk read timeout for streamed responses, in seconds.
    #[serde(default = "default_http_read_timeout", alias = "sse_read_timeout")]
    pub http_read_timeout: u64,
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_http_read_timeout() -> u64 {
    DEFAULT_HTTP_READ_TIMEOUT_SECS
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.http_read_timeout.max(1))
    }
}

/// Transport-specific connection parameters.
///
/// `HttpStream` is tried first: an entry is remote exactly when it carries a
/// URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportConfig {
    HttpStream(HttpConfig),
    Subprocess(SubprocessConfig),
}

/// Full configuration of one backend as stored per user or globally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Human-readable name shown in backend listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

impl BackendConfig {
    pub fn subprocess(command: &str, args: &[&str]) -> Self {
        Self {
            description: None,
            transport: TransportConfig::Subprocess(SubprocessConfig {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                env: BTreeMap::new(),
                cwd: None,
            }),
        }
    }

    pub fn http(url: &str) -> Self {
        Self {
            description: None,
            transport: TransportConfig::HttpStream(HttpConfig {
                server_url: url.to_string(),
                http_headers: BTreeMap::new(),
                http_timeout: DEFAULT_HTTP_TIMEOUT_SECS,
                http_read_timeout: DEFAULT_HTTP_READ_TIMEOUT_SECS,
            }),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn kind(&self) -> TransportKind {
        match self.transport {
            TransportConfig::Subprocess(_) => TransportKind::Subprocess,
            TransportConfig::HttpStream(_) => TransportKind::HttpStream,
        }
    }

    /// Display name, defaulting to the backend id.
    pub fn display_name(&self, backend_id: &str) -> String {
        match self.description.as_deref().map(str::trim) {
            Some(desc) if !desc.is_empty() => desc.to_string(),
            _ => backend_id.to_string(),
        }
    }

    /// Structural validation, plus the optional executable allowlist.
    pub fn validate(&self, allowed_commands: Option<&HashSet<String>>) -> Result<(), McpError> {
        match &self.transport {
            TransportConfig::Subprocess(sub) => {
                if sub.command.trim().is_empty() {
                    return Err(McpError::ConfigError {
                        reason: "subprocess command must not be empty".into(),
                    });
                }
                if let Some(allowed) = allowed_commands {
                    let program = command_basename(&sub.command);
                    if !allowed.contains(program) {
                        return Err(McpError::ConfigError {
                            reason: format!("command '{program}' is not in the allowed list"),
                        });
                    }
                }
            }
            TransportConfig::HttpStream(http) => {
                let url = http.server_url.trim();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(McpError::ConfigError {
                        reason: format!("server_url must be http(s), got '{url}'"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Final path component of a command (`/usr/bin/npx` → `npx`).
fn command_basename(command: &str) -> &str {
    Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(command)
}

// ─── Environment ─────────────────────────────────────────────────────────────

/// Build the environment for a child process.
///
/// Starts from a small inherited set plus any cloud credentials present in
/// the gateway's own environment; `overrides` win on key collision.
pub fn child_environment(overrides: &BTreeMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = INHERITED_ENV_VARS
        .iter()
        .chain(CREDENTIAL_ENV_VARS)
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.starts_with("()"))
                .map(|v| (key.to_string(), v))
        })
        .collect();

    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    env
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_subprocess_config() {
        let cfg: BackendConfig = serde_json::from_value(json!({
            "description": "Files",
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-filesystem"],
            "env": {"ROOT": "/tmp"}
        }))
        .unwrap();
        assert_eq!(cfg.kind(), TransportKind::Subprocess);
        assert_eq!(cfg.display_name("fs"), "Files");
        match cfg.transport {
            TransportConfig::Subprocess(sub) => {
                assert_eq!(sub.args.len(), 2);
                assert_eq!(sub.env["ROOT"], "/tmp");
            }
            _ => panic!("expected subprocess"),
        }
    }

    #[test]
    fn test_parse_http_config_with_aliases() {
        let cfg: BackendConfig = serde_json::from_value(json!({
            "url": "https://tools.example.com/mcp",
            "headers": {"Authorization": "Bearer x"}
        }))
        .unwrap();
        assert_eq!(cfg.kind(), TransportKind::HttpStream);
        match &cfg.transport {
            TransportConfig::HttpStream(http) => {
                assert_eq!(http.http_timeout, DEFAULT_HTTP_TIMEOUT_SECS);
                assert_eq!(http.http_headers["Authorization"], "Bearer x");
            }
            _ => panic!("expected http"),
        }

        // Persisted form uses the canonical names.
        let stored = serde_json::to_value(&cfg).unwrap();
        assert_eq!(stored["server_url"], "https://tools.example.com/mcp");
        assert!(stored.get("url").is_none());
    }

    #[test]
    fn test_roundtrip_through_persisted_shape() {
        let cfg = BackendConfig::subprocess("uvx", &["awslabs.docs"]).with_description("Docs");
        let stored = serde_json::to_string(&cfg).unwrap();
        let back: BackendConfig = serde_json::from_str(&stored).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_display_name_defaults_to_id() {
        let cfg = BackendConfig::http("http://localhost:8000/mcp");
        assert_eq!(cfg.display_name("search"), "search");
        let blank = cfg.with_description("   ");
        assert_eq!(blank.display_name("search"), "search");
    }

    #[test]
    fn test_validate_rejects_bad_url_and_empty_command() {
        assert!(BackendConfig::http("ftp://nope").validate(None).is_err());
        assert!(BackendConfig::subprocess(" ", &[]).validate(None).is_err());
        assert!(BackendConfig::subprocess("echo", &[]).validate(None).is_ok());
    }

    #[test]
    fn test_validate_allowlist_uses_basename() {
        let allowed: HashSet<String> = ["npx".to_string()].into_iter().collect();
        assert!(BackendConfig::subprocess("/usr/local/bin/npx", &[])
            .validate(Some(&allowed))
            .is_ok());
        let err = BackendConfig::subprocess("bash", &[])
            .validate(Some(&allowed))
            .unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_child_environment_overrides_win() {
        let mut overrides = BTreeMap::new();
        overrides.insert("PATH".to_string(), "/custom/bin".to_string());
        overrides.insert("API_TOKEN".to_string(), "abc".to_string());
        let env = child_environment(&overrides);
        assert_eq!(env["PATH"], "/custom/bin");
        assert_eq!(env["API_TOKEN"], "abc");
    }
}
