//! Shared helpers for driving the serve runtime against real child
//! processes in tests.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleet_config::{Config, NamespaceConfig, ServerConfig};
use fleet_supervisor::{EventBus, Supervisor};

/// Mock MCP server script advertising `read_file`, `write_file`, and a
/// deliberately slow `slow_tool`; one boot line goes to stderr.
pub(crate) fn write_mock_server(dir: &Path) -> PathBuf {
    let path = dir.join("mock-mcp.sh");
    fs::write(
        &path,
        r#"#!/bin/sh
echo "mock server booted" >&2
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([0-9]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"read_file","description":"read","inputSchema":{"type":"object"}},{"name":"write_file","description":"write","inputSchema":{"type":"object"}},{"name":"slow_tool","description":"slow","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      case "$line" in
        *\"slow_tool\"*) sleep 3 ;;
      esac
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"called"}],"isError":false}}\n' "$id"
      ;;
  esac
done
"#,
    )
    .unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    path
}

pub(crate) fn stdio_script(script: &Path) -> ServerConfig {
    ServerConfig::Stdio {
        command: "sh".to_string(),
        args: vec![script.to_string_lossy().into_owned()],
        cwd: None,
        env: HashMap::new(),
        enabled: None,
        autostart: false,
        tool_timeout: None,
    }
}

pub(crate) fn stdio_command(command: &str) -> ServerConfig {
    ServerConfig::Stdio {
        command: command.to_string(),
        args: Vec::new(),
        cwd: None,
        env: HashMap::new(),
        enabled: None,
        autostart: false,
        tool_timeout: None,
    }
}

pub(crate) fn config_with_servers(servers: &[(&str, &PathBuf)]) -> Config {
    let mut config = Config::default();
    for (name, script) in servers {
        config
            .servers
            .insert(name.to_string(), stdio_script(script));
    }
    config
}

pub(crate) fn add_namespace(
    config: &mut Config,
    name: &str,
    servers: &[&str],
    deny_by_default: bool,
) {
    config.namespaces.insert(
        name.to_string(),
        NamespaceConfig {
            description: format!("{name} namespace"),
            server_names: servers.iter().map(|s| s.to_string()).collect(),
            deny_by_default,
        },
    );
}

pub(crate) fn supervisor() -> Arc<Supervisor> {
    Supervisor::new(Arc::new(EventBus::default()), None)
}
