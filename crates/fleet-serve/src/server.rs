//! The NDJSON JSON-RPC session facing the downstream client.
//!
//! One task reads lines from the transport; the main loop selects over
//! shutdown, reload snapshots, and incoming lines, handling one request at
//! a time. That serial dispatch is the linearization point the reload
//! machinery relies on: a reload is never applied mid-request.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use fleet_client::PROTOCOL_VERSION;
use fleet_config::{Config, MANAGER_PREFIX};
use fleet_supervisor::Supervisor;

use crate::aggregator::Aggregator;
use crate::errors::RpcError;
use crate::namespace;
use crate::router::Router;

const LINE_CHANNEL_CAPACITY: usize = 16;

/// Serve-mode options fixed at session start.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Explicit namespace selection (resolver rule 1).
    pub namespace: Option<String>,
    /// Start every active server at `notifications/initialized` and after
    /// reloads, not just the `autostart` ones.
    pub eager_start: bool,
    pub server_name: String,
    pub server_version: String,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            eager_start: false,
            server_name: "mcp-fleet".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Drive one client session until EOF, read failure, or cancellation.
///
/// Generic over the transport so tests can drive it with in-memory pipes;
/// production passes stdin/stdout.
pub async fn run<R, W>(
    cancel: CancellationToken,
    config: Arc<Config>,
    supervisor: Arc<Supervisor>,
    options: ServeOptions,
    reader: R,
    writer: W,
    reload_rx: Option<mpsc::Receiver<Arc<Config>>>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    let aggregator = Aggregator::new(config.clone(), supervisor.clone());
    let router = Router::new(config.clone(), supervisor.clone(), aggregator.clone());
    let mut session = Session {
        cancel: cancel.clone(),
        config,
        supervisor,
        aggregator,
        router,
        options,
        writer: Mutex::new(writer),
        initialized: false,
    };

    let mut line_rx = spawn_line_reader(reader);

    // With no watcher configured, an open-but-silent channel keeps the
    // select arms uniform.
    let (_reload_keepalive, mut reload_rx) = match reload_rx {
        Some(rx) => (None, rx),
        None => {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), rx)
        }
    };

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("shutdown requested");
                break Ok(());
            }
            snapshot = reload_rx.recv() => {
                if let Some(snapshot) = snapshot {
                    session.apply_reload(snapshot).await;
                }
            }
            incoming = line_rx.recv() => match incoming {
                None => break Ok(()), // EOF: client closed the session
                Some(Ok(line)) => session.handle_line(&line).await?,
                Some(Err(error)) => {
                    break Err(error).context("failed to read from client");
                }
            },
        }
    };

    session.shutdown().await;
    result
}

/// Forward `(line, err)` pairs from the transport. Each line is its own
/// `String`, so downstream holds no reference into the reader's buffer.
fn spawn_line_reader<R>(reader: R) -> mpsc::Receiver<std::io::Result<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(Ok(line.clone())).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    // Hand over any partial final line before the error.
                    if !line.is_empty() && tx.send(Ok(line.clone())).await.is_err() {
                        break;
                    }
                    let _ = tx.send(Err(error)).await;
                    break;
                }
            }
        }
    });
    rx
}

struct Session<W> {
    cancel: CancellationToken,
    config: Arc<Config>,
    supervisor: Arc<Supervisor>,
    aggregator: Arc<Aggregator>,
    router: Arc<Router>,
    options: ServeOptions,
    writer: Mutex<W>,
    initialized: bool,
}

impl<W> Session<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn handle_line(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(error) => {
                let rpc_error = RpcError::Parse(error.to_string());
                return self.write_value(&rpc_error.to_response(Value::Null)).await;
            }
        };

        let id = message.get("id").cloned().filter(|id| !id.is_null());
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match id {
            None => {
                self.handle_notification(&method, &params);
                Ok(())
            }
            Some(id) => {
                let response = match self.handle_request(&method, &params).await {
                    Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Err(error) => error.to_response(id),
                };
                self.write_value(&response).await
            }
        }
    }

    fn handle_notification(&mut self, method: &str, params: &Value) {
        match method {
            "notifications/initialized" => {
                tracing::debug!("client session initialized");
                self.eager_start();
            }
            "notifications/cancelled" => {
                tracing::debug!(params = %params, "client cancelled a request");
            }
            other => {
                tracing::debug!(method = %other, "ignoring client notification");
            }
        }
    }

    async fn handle_request(&mut self, method: &str, params: &Value) -> Result<Value, RpcError> {
        if !self.initialized && method != "initialize" {
            return Err(RpcError::InvalidRequest(format!(
                "'{method}' sent before initialize"
            )));
        }

        match method {
            "initialize" => self.handle_initialize(params),
            "ping" => Ok(json!({})),
            "tools/list" => self.handle_tools_list().await,
            "tools/call" => self.handle_tools_call(params).await,
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }

    fn handle_initialize(&mut self, params: &Value) -> Result<Value, RpcError> {
        if self.initialized {
            return Err(RpcError::InvalidRequest(
                "initialize may only be sent once per session".to_string(),
            ));
        }

        if let Some(client) = params.get("clientInfo") {
            tracing::info!(
                client = %client.get("name").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                version = %client.get("version").and_then(serde_json::Value::as_str).unwrap_or(""),
                "client connected"
            );
        }

        let selection = namespace::resolve(&self.config, self.options.namespace.as_deref())?;
        self.router.set_active(selection);
        self.initialized = true;

        Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": self.options.server_name,
                "version": self.options.server_version,
            },
            "capabilities": {"tools": {}},
        }))
    }

    async fn handle_tools_list(&self) -> Result<Value, RpcError> {
        let selection = self.router.active();
        let tools = self
            .aggregator
            .list_tools(self.cancel.clone(), &selection.server_names)
            .await;

        let filter_by_namespace = selection.namespace.is_some();
        let listed: Vec<Value> = tools
            .into_iter()
            .filter(|tool| {
                if tool.is_manager() || !filter_by_namespace {
                    return true;
                }
                self.router
                    .tool_allowed(tool.server_name(), tool.original_name())
                    .0
            })
            .map(|tool| {
                json!({
                    "name": tool.qualified_name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();

        Ok(json!({"tools": listed}))
    }

    async fn handle_tools_call(&self, params: &Value) -> Result<Value, RpcError> {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Err(RpcError::InvalidParams(
                "tools/call requires a 'name' parameter".to_string(),
            ));
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        // Non-manager calls are checked against the active server set
        // before the router spawns anything.
        if let Some((prefix, _)) = name.split_once('.') {
            if prefix != MANAGER_PREFIX {
                let selection = self.router.active();
                if !selection.contains_server(prefix) {
                    return Err(RpcError::ServerNotFound(prefix.to_string()));
                }
                let enabled = self
                    .config
                    .servers
                    .get(prefix)
                    .is_some_and(|server| server.enabled());
                if !enabled {
                    return Err(RpcError::ServerNotRunning {
                        server: prefix.to_string(),
                        reason: "disabled".to_string(),
                    });
                }
            }
        }

        let outcome = self
            .router
            .call_tool(self.cancel.clone(), name, arguments)
            .await?;
        Ok(json!({
            "content": outcome.content,
            "isError": outcome.is_error,
        }))
    }

    /// Apply a reload snapshot. Runs on the loop task, strictly between
    /// requests: every child is stopped, the snapshot swapped, the
    /// selection preserved where possible, and aggregator/router rebuilt
    /// against the new config.
    async fn apply_reload(&mut self, snapshot: Arc<Config>) {
        tracing::info!("applying config reload");
        self.supervisor.stop_all().await;

        let previous = self.router.active();
        self.config = snapshot;

        self.aggregator = Aggregator::new(self.config.clone(), self.supervisor.clone());
        self.router = Router::new(
            self.config.clone(),
            self.supervisor.clone(),
            self.aggregator.clone(),
        );

        if self.initialized {
            let selection = namespace::reselect_after_reload(
                &self.config,
                self.options.namespace.as_deref(),
                &previous,
            );
            self.router.set_active(selection);
            self.eager_start();
        }
    }

    /// Spawn the active servers in the background: all of them under
    /// `--eager-start`, otherwise just the `autostart` ones.
    fn eager_start(&self) {
        let selection = self.router.active();
        for name in selection.server_names {
            let Some(server_config) = self.config.servers.get(&name).cloned() else {
                continue;
            };
            if !server_config.enabled() {
                continue;
            }
            if !self.options.eager_start && !server_config.autostart() {
                continue;
            }

            let supervisor = self.supervisor.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(error) = supervisor.start(cancel, &name, &server_config).await {
                    tracing::warn!(server = %name, error = %format!("{error:#}"), "eager start failed");
                }
            });
        }
    }

    async fn write_value(&self, value: &Value) -> Result<()> {
        let payload = serde_json::to_string(value).context("failed to serialize response")?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(payload.as_bytes())
            .await
            .context("failed to write response")?;
        writer
            .write_all(b"\n")
            .await
            .context("failed to write response delimiter")?;
        writer.flush().await.context("failed to flush response")
    }

    async fn shutdown(&self) {
        self.supervisor.stop_all().await;
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
