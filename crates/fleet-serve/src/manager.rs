//! Manager tools: synthetic tools implemented by the aggregator itself,
//! exposed under the reserved `fleet.` prefix for controlling the server
//! fleet from the client side.

use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use fleet_client::ToolCallOutcome;
use fleet_config::Config;
use fleet_supervisor::{ChildState, Supervisor};

use crate::aggregator::{AggregatedTool, Aggregator};
use crate::errors::RpcError;
use crate::namespace::ActiveSelection;
use crate::router::LAZY_START_TIMEOUT;

const DEFAULT_LOG_LINES: i64 = 50;

pub(crate) fn tool_definitions() -> Vec<AggregatedTool> {
    let server_id_schema = json!({
        "type": "object",
        "properties": {
            "server_id": {"type": "string", "description": "Configured server name"}
        },
        "required": ["server_id"]
    });

    vec![
        AggregatedTool::manager(
            "servers_list",
            "List every configured server with its current status",
            json!({"type": "object", "properties": {}}),
        ),
        AggregatedTool::manager(
            "servers_start",
            "Start a configured server and refresh its tools",
            server_id_schema.clone(),
        ),
        AggregatedTool::manager(
            "servers_stop",
            "Stop a running server",
            server_id_schema.clone(),
        ),
        AggregatedTool::manager(
            "servers_restart",
            "Restart a server and refresh its tools",
            server_id_schema,
        ),
        AggregatedTool::manager(
            "server_logs",
            "Return the most recent stderr lines captured for a server",
            json!({
                "type": "object",
                "properties": {
                    "server_id": {"type": "string", "description": "Configured server name"},
                    "lines": {"type": "integer", "description": "Number of lines (default 50)"}
                },
                "required": ["server_id"]
            }),
        ),
        AggregatedTool::manager(
            "namespaces_list",
            "List configured namespaces and the active selection",
            json!({"type": "object", "properties": {}}),
        ),
    ]
}

pub(crate) async fn dispatch(
    cancel: CancellationToken,
    config: &Arc<Config>,
    supervisor: &Arc<Supervisor>,
    aggregator: &Aggregator,
    selection: &ActiveSelection,
    tool: &str,
    arguments: &Value,
) -> Result<ToolCallOutcome, RpcError> {
    match tool {
        "servers_list" => Ok(text_outcome(servers_list(config, supervisor))),
        "servers_start" => {
            let server = require_server_id(arguments)?;
            start_server(cancel, config, supervisor, aggregator, &server).await
        }
        "servers_stop" => {
            let server = require_server_id(arguments)?;
            ensure_known_server(config, &server)?;
            supervisor
                .stop(&server)
                .await
                .map_err(|error| RpcError::Internal(format!("{error:#}")))?;
            Ok(text_outcome(json!({"server": server, "status": "stopped"})))
        }
        "servers_restart" => {
            let server = require_server_id(arguments)?;
            ensure_known_server(config, &server)?;
            supervisor
                .stop(&server)
                .await
                .map_err(|error| RpcError::Internal(format!("{error:#}")))?;
            start_server(cancel, config, supervisor, aggregator, &server).await
        }
        "server_logs" => {
            let server = require_server_id(arguments)?;
            ensure_known_server(config, &server)?;
            server_logs(supervisor, &server, arguments)
        }
        "namespaces_list" => Ok(text_outcome(namespaces_list(config, selection))),
        other => Err(RpcError::ToolNotFound(format!(
            "{}.{other}",
            fleet_config::MANAGER_PREFIX
        ))),
    }
}

fn servers_list(config: &Config, supervisor: &Supervisor) -> Value {
    let servers: Vec<Value> = config
        .servers
        .iter()
        .map(|(name, server_config)| {
            let handle = supervisor.get(name);
            let running = handle
                .as_ref()
                .is_some_and(|handle| handle.state() == ChildState::Running);

            let mut entry = json!({
                "name": name,
                "kind": server_config.kind_label(),
                "enabled": server_config.enabled(),
                "status": if running { "running" } else { "stopped" },
            });
            if let Some(command) = server_config.command() {
                entry["command"] = json!(command);
            }
            if running {
                let handle = handle.expect("running implies handle");
                if let Some(pid) = handle.pid() {
                    entry["pid"] = json!(pid);
                }
                if let Some(uptime) = handle.uptime() {
                    entry["uptimeSecs"] = json!(uptime.as_secs());
                }
                entry["toolCount"] = json!(handle.tool_count());
            }
            entry
        })
        .collect();

    json!({"servers": servers})
}

async fn start_server(
    cancel: CancellationToken,
    config: &Arc<Config>,
    supervisor: &Arc<Supervisor>,
    aggregator: &Aggregator,
    server: &str,
) -> Result<ToolCallOutcome, RpcError> {
    let Some(server_config) = config.servers.get(server) else {
        return Err(RpcError::ServerNotFound(server.to_string()));
    };
    if !server_config.enabled() {
        return Err(RpcError::ServerNotRunning {
            server: server.to_string(),
            reason: "disabled".to_string(),
        });
    }

    let started = tokio::time::timeout(
        LAZY_START_TIMEOUT,
        supervisor.start(cancel, server, server_config),
    )
    .await;
    match started {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => {
            return Err(RpcError::ServerFailedToStart {
                server: server.to_string(),
                reason: format!("{error:#}"),
            });
        }
        Err(_) => {
            return Err(RpcError::ServerFailedToStart {
                server: server.to_string(),
                reason: format!("start timed out after {}s", LAZY_START_TIMEOUT.as_secs()),
            });
        }
    }

    let tool_count = aggregator.refresh_server_tools(server);
    Ok(text_outcome(json!({
        "server": server,
        "status": "running",
        "toolCount": tool_count,
    })))
}

fn server_logs(
    supervisor: &Supervisor,
    server: &str,
    arguments: &Value,
) -> Result<ToolCallOutcome, RpcError> {
    let lines = match arguments.get("lines") {
        None | Some(Value::Null) => DEFAULT_LOG_LINES,
        Some(value) => value
            .as_i64()
            .ok_or_else(|| RpcError::InvalidParams("lines must be an integer".to_string()))?,
    };
    if lines < 0 {
        return Err(RpcError::InvalidParams(
            "lines must be non-negative".to_string(),
        ));
    }
    let lines = if lines == 0 { DEFAULT_LOG_LINES } else { lines };
    let lines = lines as usize;

    let Some(handle) = supervisor.get(server) else {
        return Ok(text_block_outcome(format!(
            "server '{server}' has not been started; no log output recorded"
        )));
    };

    let tail = handle.logs().tail(lines);
    if tail.is_empty() {
        return Ok(text_block_outcome(format!(
            "no log output recorded for server '{server}'"
        )));
    }
    Ok(text_block_outcome(tail.join("\n")))
}

fn namespaces_list(config: &Config, selection: &ActiveSelection) -> Value {
    let namespaces: Vec<Value> = config
        .namespaces
        .iter()
        .map(|(name, namespace)| {
            json!({
                "name": name,
                "description": namespace.description,
                "serverCount": namespace.server_names.len(),
                "serverNames": namespace.server_names,
            })
        })
        .collect();

    json!({
        "activeNamespace": selection.namespace,
        "selection": selection.method.label(),
        "namespaces": namespaces,
    })
}

fn require_server_id(arguments: &Value) -> Result<String, RpcError> {
    arguments
        .get("server_id")
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RpcError::InvalidParams("server_id is required".to_string()))
}

fn ensure_known_server(config: &Config, server: &str) -> Result<(), RpcError> {
    if config.servers.contains_key(server) {
        Ok(())
    } else {
        Err(RpcError::ServerNotFound(server.to_string()))
    }
}

fn text_outcome(payload: Value) -> ToolCallOutcome {
    let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
    text_block_outcome(text)
}

fn text_block_outcome(text: String) -> ToolCallOutcome {
    ToolCallOutcome {
        content: vec![json!({"type": "text", "text": text})],
        is_error: false,
    }
}
