use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use fleet_client::{ClientError, ToolCallOutcome};
use fleet_config::{Config, MANAGER_PREFIX, is_allowed};
use fleet_supervisor::Supervisor;

use crate::aggregator::Aggregator;
use crate::errors::RpcError;
use crate::manager;
use crate::namespace::{ActiveSelection, SelectionMethod};

/// How long a lazy start may take on first use of a server's tool.
pub(crate) const LAZY_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves qualified tool names to upstream servers and forwards calls,
/// gating them on the active namespace's permissions. Rebuilt on reload.
pub struct Router {
    config: Arc<Config>,
    supervisor: Arc<Supervisor>,
    aggregator: Arc<Aggregator>,
    active: RwLock<ActiveSelection>,
    ghost_namespace_warned: AtomicBool,
}

impl Router {
    pub fn new(
        config: Arc<Config>,
        supervisor: Arc<Supervisor>,
        aggregator: Arc<Aggregator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            supervisor,
            aggregator,
            active: RwLock::new(ActiveSelection {
                namespace: None,
                server_names: Vec::new(),
                method: SelectionMethod::All,
            }),
            ghost_namespace_warned: AtomicBool::new(false),
        })
    }

    /// Record the selection used for permission checks and the
    /// `namespaces_list` envelope.
    pub fn set_active(&self, selection: ActiveSelection) {
        tracing::info!(
            namespace = selection.namespace.as_deref().unwrap_or("<all>"),
            method = selection.method.label(),
            servers = selection.server_names.len(),
            "active namespace selection updated"
        );
        *self.active.write().expect("selection poisoned") = selection;
    }

    pub fn active(&self) -> ActiveSelection {
        self.active.read().expect("selection poisoned").clone()
    }

    /// Permission verdict for one qualified tool under the active
    /// selection, with the ghost-namespace warning surfaced once.
    pub fn tool_allowed(&self, server: &str, tool: &str) -> (bool, &'static str) {
        let selection = self.active.read().expect("selection poisoned");
        let Some(namespace) = selection.namespace.as_deref() else {
            return (true, "no active namespace");
        };

        if !self.config.namespaces.contains_key(namespace)
            && !self.ghost_namespace_warned.swap(true, Ordering::AcqRel)
        {
            tracing::warn!(
                namespace = %namespace,
                "active namespace is missing from the config; permissions fail open"
            );
        }

        is_allowed(&self.config, Some(namespace), server, tool)
    }

    /// Forward one `tools/call`. Manager tools dispatch internally and
    /// bypass the permission engine.
    pub async fn call_tool(
        &self,
        cancel: CancellationToken,
        qualified_name: &str,
        arguments: Value,
    ) -> Result<ToolCallOutcome, RpcError> {
        let Some((prefix, tool)) = qualified_name.split_once('.') else {
            return Err(RpcError::InvalidParams(format!(
                "tool name '{qualified_name}' is not qualified as <server>.<tool>"
            )));
        };

        if prefix == MANAGER_PREFIX {
            let selection = self.active();
            return manager::dispatch(
                cancel,
                &self.config,
                &self.supervisor,
                &self.aggregator,
                &selection,
                tool,
                &arguments,
            )
            .await;
        }

        let (allowed, reason) = self.tool_allowed(prefix, tool);
        if !allowed {
            return Err(RpcError::ToolDenied {
                name: qualified_name.to_string(),
                reason: reason.to_string(),
            });
        }

        let Some(server_config) = self.config.servers.get(prefix) else {
            return Err(RpcError::ServerNotFound(prefix.to_string()));
        };
        if !server_config.enabled() {
            return Err(RpcError::ServerNotRunning {
                server: prefix.to_string(),
                reason: "disabled".to_string(),
            });
        }

        let handle = match self.supervisor.get(prefix) {
            Some(handle) if handle.state().is_running() => handle,
            _ => {
                let started = tokio::time::timeout(
                    LAZY_START_TIMEOUT,
                    self.supervisor.start(cancel.clone(), prefix, server_config),
                )
                .await;
                match started {
                    Ok(Ok(handle)) => handle,
                    Ok(Err(error)) => {
                        return Err(RpcError::ServerFailedToStart {
                            server: prefix.to_string(),
                            reason: format!("{error:#}"),
                        });
                    }
                    Err(_) => {
                        return Err(RpcError::ServerFailedToStart {
                            server: prefix.to_string(),
                            reason: format!(
                                "start timed out after {}s",
                                LAZY_START_TIMEOUT.as_secs()
                            ),
                        });
                    }
                }
            }
        };

        let Some(client) = handle.client() else {
            return Err(RpcError::Internal(format!(
                "server '{prefix}' has no live client"
            )));
        };

        let call = tokio::time::timeout(
            server_config.tool_timeout(),
            client.call_tool(cancel, tool, arguments),
        )
        .await;
        match call {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(ClientError::Cancelled)) => {
                Err(RpcError::Internal("tool call cancelled".to_string()))
            }
            Ok(Err(error)) => Err(RpcError::Internal(format!(
                "forwarding to server '{prefix}' failed: {error}"
            ))),
            Err(_) => Err(RpcError::ToolCallTimeout(qualified_name.to_string())),
        }
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
