//! Gateway settings file.
//!
//! YAML or JSON (JSON parses as YAML). Carries the shared backends under
//! `mcpServers` plus timing knobs. `${VAR}` and `${VAR:-default}` are
//! expanded from the environment before parsing, so credentials can stay
//! out of the file.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::config_store::BackendMap;
use super::errors::GatewayError;
use crate::mcp_client::BackendConfig;

/// Env var overriding `idle_timeout_mins`.
pub const INACTIVE_TIME_ENV: &str = "INACTIVE_TIME";

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Shared backends, keyed by id. Kept raw so one bad entry is skipped
    /// rather than failing the whole file.
    #[serde(rename = "mcpServers", alias = "mcp_servers")]
    pub mcp_servers: BTreeMap<String, Value>,
    pub sweep_interval_secs: u64,
    pub idle_timeout_mins: u64,
    pub connect_timeout_secs: u64,
    pub tool_call_timeout_secs: u64,
    /// When set, only these executables may be launched as backends.
    pub allowed_commands: Option<HashSet<String>>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            mcp_servers: BTreeMap::new(),
            sweep_interval_secs: 300,
            idle_timeout_mins: 1440,
            connect_timeout_secs: 30,
            tool_call_timeout_secs: 300,
            allowed_commands: None,
        }
    }
}

/// A shared backend entry; `status: 0` disables it.
#[derive(Debug, Clone, Deserialize)]
struct GlobalBackendEntry {
    #[serde(flatten)]
    config: BackendConfig,
    #[serde(default = "default_status")]
    status: i64,
}

fn default_status() -> i64 {
    1
}

impl GatewaySettings {
    /// Read settings from `path`, or defaults when no path is given.
    /// `INACTIVE_TIME` is applied either way.
    pub fn load(path: Option<&Path>) -> Result<Self, GatewayError> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| GatewayError::InvalidConfig {
                    reason: format!("failed to read {}: {e}", path.display()),
                })?;
                Self::parse(&raw)?
            }
            None => Self::default(),
        };
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        serde_yaml::from_str(&interpolate_env_vars(raw)).map_err(|e| GatewayError::InvalidConfig {
            reason: format!("failed to parse settings: {e}"),
        })
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(INACTIVE_TIME_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(mins) => self.idle_timeout_mins = mins,
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring non-numeric {INACTIVE_TIME_ENV}");
                }
            }
        }
    }

    /// Enabled, well-formed shared backends.
    pub fn global_backends(&self) -> BackendMap {
        let mut map = BackendMap::new();
        for (id, value) in &self.mcp_servers {
            match serde_json::from_value::<GlobalBackendEntry>(value.clone()) {
                Ok(entry) if entry.status == 0 => {
                    tracing::debug!(backend = %id, "global backend disabled");
                }
                Ok(entry) => {
                    map.insert(id.clone(), entry.config);
                }
                Err(e) => {
                    tracing::warn!(backend = %id, error = %e, "skipping malformed global backend");
                }
            }
        }
        map
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_mins.max(1) * 60)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_call_timeout_secs.max(1))
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}`; unset vars without a default
/// become empty.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated; keep the text as written.
            result.push_str(&rest[start..]);
            return result;
        };
        let expr = &after[..end];
        let value = match expr.split_once(":-") {
            Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
            None => std::env::var(expr).unwrap_or_default(),
        };
        result.push_str(&value);
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    result
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::TransportKind;

    #[test]
    fn test_defaults() {
        let settings = GatewaySettings::parse("{}").unwrap();
        assert_eq!(settings.sweep_interval(), Duration::from_secs(300));
        assert_eq!(settings.idle_timeout(), Duration::from_secs(24 * 60 * 60));
        assert!(settings.allowed_commands.is_none());
    }

    #[test]
    fn test_parse_json_mcp_servers_skips_disabled_and_malformed() {
        let raw = r#"{
            "mcpServers": {
                "shared-search": {"url": "https://search.example.com/mcp", "description": "Search"},
                "docs": {"command": "uvx", "args": ["awslabs.aws-documentation-mcp-server"]},
                "off": {"command": "npx", "status": 0},
                "junk": {"nothing": "here"}
            },
            "idle_timeout_mins": 30
        }"#;
        let settings = GatewaySettings::parse(raw).unwrap();
        let backends = settings.global_backends();
        assert_eq!(
            backends.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["docs", "shared-search"]
        );
        assert_eq!(backends["shared-search"].kind(), TransportKind::HttpStream);
        assert_eq!(backends["shared-search"].display_name("shared-search"), "Search");
        assert_eq!(settings.idle_timeout(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_parse_yaml_with_allowlist() {
        let raw = "
sweep_interval_secs: 60
allowed_commands: [npx, uvx]
mcpServers:
  fs:
    command: npx
    args: ['-y', '@modelcontextprotocol/server-filesystem', '/tmp']
";
        let settings = GatewaySettings::parse(raw).unwrap();
        assert_eq!(settings.sweep_interval(), Duration::from_secs(60));
        assert!(settings.allowed_commands.unwrap().contains("uvx"));
    }

    #[test]
    fn test_inactive_time_override() {
        let mut settings = GatewaySettings::default();
        settings.apply_env_overrides(|key| (key == INACTIVE_TIME_ENV).then(|| "5".to_string()));
        assert_eq!(settings.idle_timeout(), Duration::from_secs(300));

        settings.apply_env_overrides(|_| Some("soon".to_string()));
        assert_eq!(settings.idle_timeout_mins, 5);
    }

    #[test]
    fn test_interpolation() {
        std::env::remove_var("__GATEWAY_TEST_UNSET__");
        assert_eq!(
            interpolate_env_vars("token: ${__GATEWAY_TEST_UNSET__:-fallback}"),
            "token: fallback"
        );
        assert_eq!(interpolate_env_vars("a ${__GATEWAY_TEST_UNSET__} b"), "a  b");
        assert_eq!(interpolate_env_vars("cost: $5 ${oops"), "cost: $5 ${oops");
    }
}
