use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Reserved prefix for manager tools synthesized by the aggregator itself.
///
/// A configured server may not take this name; validation rejects the
/// collision so qualified names stay unambiguous.
pub const MANAGER_PREFIX: &str = "fleet";

/// Config schema version written by this build. Loads with a newer version
/// are rejected rather than silently misread.
pub const SCHEMA_VERSION: u32 = 1;

const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

/// Immutable configuration snapshot.
///
/// The serve loop owns an `Arc<Config>` and replaces the whole snapshot on
/// hot reload; nothing mutates a snapshot in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Upstream servers keyed by name. BTreeMap keeps listings and the
    /// all-servers selection deterministic.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespaceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,
    /// Ordered permission rules; the `(namespace, server, tool)` triple is
    /// unique after validation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_permissions: Vec<ToolPermission>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            servers: BTreeMap::new(),
            namespaces: BTreeMap::new(),
            default_namespace: None,
            tool_permissions: Vec::new(),
        }
    }
}

impl Config {
    /// Names of every enabled server, in map order.
    pub fn enabled_server_names(&self) -> Vec<String> {
        self.servers
            .iter()
            .filter(|(_, cfg)| cfg.enabled())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Upstream server transport configuration.
///
/// Serialized with `type = "stdio"` / `type = "streamable-http"`; entries
/// without a `type` field that carry `command` are accepted as legacy stdio
/// definitions.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerConfig {
    #[serde(rename = "stdio", rename_all = "camelCase")]
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enabled: Option<bool>,
        #[serde(default)]
        autostart: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_timeout: Option<u64>,
    },
    #[serde(rename = "streamable-http", rename_all = "camelCase")]
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token_env_var: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scopes: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enabled: Option<bool>,
        #[serde(default)]
        autostart: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_timeout: Option<u64>,
    },
}

impl ServerConfig {
    /// Servers default to enabled when the field is omitted.
    pub fn enabled(&self) -> bool {
        match self {
            Self::Stdio { enabled, .. } | Self::StreamableHttp { enabled, .. } => {
                enabled.unwrap_or(true)
            }
        }
    }

    pub fn autostart(&self) -> bool {
        match self {
            Self::Stdio { autostart, .. } | Self::StreamableHttp { autostart, .. } => *autostart,
        }
    }

    /// Per-call timeout applied by the router when forwarding `tools/call`.
    pub fn tool_timeout(&self) -> Duration {
        let secs = match self {
            Self::Stdio { tool_timeout, .. } | Self::StreamableHttp { tool_timeout, .. } => {
                tool_timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)
            }
        };
        Duration::from_secs(secs)
    }

    pub fn env(&self) -> &HashMap<String, String> {
        match self {
            Self::Stdio { env, .. } | Self::StreamableHttp { env, .. } => env,
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Stdio { command, .. } => Some(command),
            Self::StreamableHttp { .. } => None,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::StreamableHttp { .. } => "streamable-http",
        }
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self, Self::Stdio { .. })
    }
}

/// Custom deserializer for backward-compatible server entries.
///
/// Handles three cases:
/// 1. Explicit `type` field → deserialize the matching variant.
/// 2. No `type` field + has `command` → legacy stdio entry.
/// 3. No `type` field + no `command` → error with a helpful message.
impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            #[serde(rename = "type")]
            transport_type: Option<String>,
            // Stdio fields
            command: Option<String>,
            #[serde(default)]
            args: Vec<String>,
            cwd: Option<PathBuf>,
            // StreamableHttp fields
            url: Option<String>,
            bearer_token_env_var: Option<String>,
            #[serde(default)]
            scopes: Vec<String>,
            // Common
            #[serde(default)]
            env: HashMap<String, String>,
            enabled: Option<bool>,
            #[serde(default)]
            autostart: bool,
            tool_timeout: Option<u64>,
        }

        let raw = Raw::deserialize(deserializer)?;

        match raw.transport_type.as_deref() {
            Some("stdio") => {
                let command = raw.command.ok_or_else(|| {
                    serde::de::Error::custom("type = \"stdio\" requires a 'command' field")
                })?;
                Ok(ServerConfig::Stdio {
                    command,
                    args: raw.args,
                    cwd: raw.cwd,
                    env: raw.env,
                    enabled: raw.enabled,
                    autostart: raw.autostart,
                    tool_timeout: raw.tool_timeout,
                })
            }
            Some("streamable-http") => {
                let url = raw.url.ok_or_else(|| {
                    serde::de::Error::custom("type = \"streamable-http\" requires a 'url' field")
                })?;
                Ok(ServerConfig::StreamableHttp {
                    url,
                    bearer_token_env_var: raw.bearer_token_env_var,
                    scopes: raw.scopes,
                    env: raw.env,
                    enabled: raw.enabled,
                    autostart: raw.autostart,
                    tool_timeout: raw.tool_timeout,
                })
            }
            Some(other) => Err(serde::de::Error::custom(format!(
                "unknown server type '{other}' (expected: stdio, streamable-http)"
            ))),
            None => {
                // Legacy entry: no type tag.
                if let Some(command) = raw.command {
                    Ok(ServerConfig::Stdio {
                        command,
                        args: raw.args,
                        cwd: raw.cwd,
                        env: raw.env,
                        enabled: raw.enabled,
                        autostart: raw.autostart,
                        tool_timeout: raw.tool_timeout,
                    })
                } else {
                    Err(serde::de::Error::custom(
                        "missing 'type' field; add type = \"stdio\" (with 'command') or \
                         type = \"streamable-http\" (with 'url')",
                    ))
                }
            }
        }
    }
}

/// A named scope over a subset of servers, with optional deny-by-default
/// tool permissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceConfig {
    #[serde(default)]
    pub description: String,
    /// Server references; unknown names are tolerated at load and ignored
    /// at runtime.
    #[serde(default)]
    pub server_names: Vec<String>,
    #[serde(default)]
    pub deny_by_default: bool,
}

/// One permission rule. The triple `(namespace, server, tool_name)` is
/// unique within a config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolPermission {
    pub namespace: String,
    pub server: String,
    pub tool_name: String,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_stdio_and_http_servers() {
        let json = r#"
        {
            "schemaVersion": 1,
            "servers": {
                "files": {
                    "type": "stdio",
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
                    "env": {"FOO": "bar"},
                    "autostart": true
                },
                "wiki": {
                    "type": "streamable-http",
                    "url": "https://mcp.example.com/mcp",
                    "bearerTokenEnvVar": "WIKI_TOKEN",
                    "toolTimeout": 120
                }
            }
        }
        "#;

        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.schema_version, 1);

        let files = &cfg.servers["files"];
        assert!(files.is_stdio());
        assert!(files.enabled());
        assert!(files.autostart());
        assert_eq!(files.command(), Some("npx"));
        assert_eq!(files.env().get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(files.tool_timeout(), Duration::from_secs(60));

        let wiki = &cfg.servers["wiki"];
        assert_eq!(wiki.kind_label(), "streamable-http");
        assert!(!wiki.autostart());
        assert_eq!(wiki.tool_timeout(), Duration::from_secs(120));
        match wiki {
            ServerConfig::StreamableHttp {
                url,
                bearer_token_env_var,
                ..
            } => {
                assert_eq!(url, "https://mcp.example.com/mcp");
                assert_eq!(bearer_token_env_var.as_deref(), Some("WIKI_TOKEN"));
            }
            other => panic!("expected streamable-http, got {other:?}"),
        }
    }

    #[test]
    fn parses_legacy_untyped_stdio_entry() {
        let json = r#"
        {
            "servers": {
                "gh": {"command": "gh-mcp", "args": ["--stdio"]}
            }
        }
        "#;

        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!(cfg.servers["gh"].is_stdio());
        assert_eq!(cfg.servers["gh"].command(), Some("gh-mcp"));
    }

    #[test]
    fn missing_type_and_command_is_rejected() {
        let json = r#"{"servers": {"bad": {"url": "https://example.com"}}}"#;
        let err = serde_json::from_str::<Config>(json).unwrap_err();
        assert!(err.to_string().contains("missing 'type' field"), "{err}");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let json = r#"{"servers": {"bad": {"type": "websocket", "url": "wss://x"}}}"#;
        let err = serde_json::from_str::<Config>(json).unwrap_err();
        assert!(err.to_string().contains("unknown server type"), "{err}");
    }

    #[test]
    fn disabled_flag_and_namespaces_round_trip() {
        let json = r#"
        {
            "servers": {
                "a": {"command": "a-mcp", "enabled": false}
            },
            "namespaces": {
                "work": {
                    "description": "daily drivers",
                    "serverNames": ["a"],
                    "denyByDefault": true
                }
            },
            "defaultNamespace": "work",
            "toolPermissions": [
                {"namespace": "work", "server": "a", "toolName": "read", "enabled": true}
            ]
        }
        "#;

        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!(!cfg.servers["a"].enabled());
        assert!(cfg.enabled_server_names().is_empty());
        assert!(cfg.namespaces["work"].deny_by_default);
        assert_eq!(cfg.default_namespace.as_deref(), Some("work"));

        let out = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&out).unwrap();
        assert_eq!(back, cfg);
    }
}
