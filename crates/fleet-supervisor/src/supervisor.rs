use anyhow::{Context, Result, anyhow, bail};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use fleet_client::{ClientInfo, HttpClient, StdioClient, UpstreamClient};
use fleet_config::ServerConfig;

use crate::events::{Event, EventBus};
use crate::handle::{ChildHandle, ChildState};
use crate::logring::DEFAULT_LOG_CAPACITY;
use crate::pidtrack::PidTracker;

/// How long a child gets between SIGTERM and SIGKILL.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns every child handle, keyed by server name. One handle per name at a
/// time; terminal handles are replaced by fresh ones on the next start.
pub struct Supervisor {
    handles: Mutex<HashMap<String, Arc<ChildHandle>>>,
    events: Arc<EventBus>,
    pid_tracker: Option<Arc<PidTracker>>,
    client_info: ClientInfo,
    log_capacity: usize,
}

impl Supervisor {
    pub fn new(events: Arc<EventBus>, pid_tracker: Option<PidTracker>) -> Arc<Self> {
        let pid_tracker = pid_tracker.map(Arc::new);
        if let Some(tracker) = &pid_tracker {
            let swept = tracker.sweep();
            if swept > 0 {
                tracing::info!(swept, "cleaned up pid files from a previous run");
            }
        }

        Arc::new(Self {
            handles: Mutex::new(HashMap::new()),
            events,
            pid_tracker,
            client_info: ClientInfo {
                name: "mcp-fleet".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            log_capacity: DEFAULT_LOG_CAPACITY,
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn get(&self, name: &str) -> Option<Arc<ChildHandle>> {
        self.handles
            .lock()
            .expect("handle map poisoned")
            .get(name)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<ChildHandle>> {
        self.handles
            .lock()
            .expect("handle map poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Spawn `name` if it is not already live. Returns the existing handle
    /// for a Running child; a concurrent start in flight is awaited rather
    /// than duplicated. Spawn, handshake, and tool discovery all happen
    /// outside the map lock, on their own task: a caller that gives up
    /// waiting (discovery timeout) leaves the startup running to a
    /// terminal state instead of stranding the handle in Starting.
    pub async fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
        name: &str,
        config: &ServerConfig,
    ) -> Result<Arc<ChildHandle>> {
        enum Existing {
            Running(Arc<ChildHandle>),
            Starting(Arc<ChildHandle>),
        }

        let existing = {
            let mut handles = self.handles.lock().expect("handle map poisoned");
            if let Some(existing) = handles.get(name) {
                match existing.state() {
                    ChildState::Running => Some(Existing::Running(existing.clone())),
                    ChildState::Starting => Some(Existing::Starting(existing.clone())),
                    // Terminal or stopping: replace with a fresh handle.
                    _ => {
                        handles.remove(name);
                        None
                    }
                }
            } else {
                None
            }
        };

        let handle = match existing {
            Some(Existing::Running(existing)) => return Ok(existing),
            Some(Existing::Starting(existing)) => {
                return self.await_startup(cancel, existing).await;
            }
            None => {
                let mut handles = self.handles.lock().expect("handle map poisoned");
                let handle = ChildHandle::new(name, config.clone(), self.log_capacity);
                handles.insert(name.to_string(), handle.clone());
                handle
            }
        };

        self.events.publish(Event::StatusChanged {
            server: name.to_string(),
            old: ChildState::Stopped,
            new: ChildState::Starting,
            error: None,
        });

        let this = self.clone();
        let startup_handle = handle.clone();
        let startup = tokio::spawn(async move {
            let result = match startup_handle.config() {
                ServerConfig::Stdio { .. } => {
                    this.start_stdio(cancel.clone(), &startup_handle).await
                }
                ServerConfig::StreamableHttp { .. } => {
                    this.start_http(cancel.clone(), &startup_handle).await
                }
            };

            match result {
                Ok(()) => {
                    if let Some(old) = startup_handle.transition(ChildState::Running) {
                        this.events.publish(Event::StatusChanged {
                            server: startup_handle.name().to_string(),
                            old,
                            new: ChildState::Running,
                            error: None,
                        });
                    }
                    tracing::info!(
                        server = %startup_handle.name(),
                        pid = ?startup_handle.pid(),
                        tools = startup_handle.tool_count(),
                        "upstream server started"
                    );
                    Ok(())
                }
                Err(error) => {
                    this.abort_startup(&startup_handle, &error);
                    Err(error)
                }
            }
        });

        match startup.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(error)) => Err(error),
            Err(join_error) => Err(anyhow!(
                "startup of '{name}' did not complete: {join_error}"
            )),
        }
    }

    /// Another caller is mid-handshake; wait for it to settle.
    async fn await_startup(
        &self,
        cancel: CancellationToken,
        handle: Arc<ChildHandle>,
    ) -> Result<Arc<ChildHandle>> {
        let mut state = handle.watch_state();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ChildState::Running => return Ok(handle),
                ChildState::Starting => {}
                other => bail!(
                    "server '{}' failed to start (state: {})",
                    handle.name(),
                    other.label()
                ),
            }

            tokio::select! {
                _ = cancel.cancelled() => bail!("start of '{}' cancelled", handle.name()),
                changed = state.changed() => {
                    if changed.is_err() {
                        bail!("server '{}' handle dropped during startup", handle.name());
                    }
                }
            }
        }
    }

    fn abort_startup(&self, handle: &Arc<ChildHandle>, error: &anyhow::Error) {
        self.events.publish(Event::Error {
            server: handle.name().to_string(),
            message: format!("{error:#}"),
        });
        // Mark failed before killing so the exit watcher stays quiet.
        let old = handle.transition(ChildState::Failed);
        if let Some(pid) = handle.pid() {
            signal_group(pid, libc::SIGKILL);
        }
        if let Some(tracker) = &self.pid_tracker {
            tracker.clear(handle.name());
        }
        if let Some(old) = old {
            self.events.publish(Event::StatusChanged {
                server: handle.name().to_string(),
                old,
                new: ChildState::Failed,
                error: Some(format!("{error:#}")),
            });
        }
        tracing::warn!(server = %handle.name(), error = %format!("{error:#}"), "upstream server failed to start");
    }

    async fn start_stdio(
        &self,
        cancel: CancellationToken,
        handle: &Arc<ChildHandle>,
    ) -> Result<()> {
        let ServerConfig::Stdio {
            command,
            args,
            cwd,
            env,
            ..
        } = handle.config()
        else {
            bail!("server '{}' is not a stdio server", handle.name());
        };

        let mut cmd = Command::new(command);
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(env);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        // Isolate the child in its own process group so stop/cleanup can
        // signal the whole tree.
        // SAFETY: setsid is async-signal-safe and runs before exec.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{command}'"))?;

        let pid = child.id();
        handle.set_pid(pid);
        handle.mark_started();
        if let (Some(tracker), Some(pid)) = (&self.pid_tracker, pid) {
            tracker.record(handle.name(), pid);
        }

        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_pump(handle.clone(), self.events.clone(), stderr);
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdin of '{}'", handle.name()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdout of '{}'", handle.name()))?;

        let client: Arc<dyn UpstreamClient> = StdioClient::spawn(handle.name(), stdout, stdin);
        handle.set_client(client.clone());

        spawn_exit_watcher(
            handle.clone(),
            self.events.clone(),
            self.pid_tracker.clone(),
            child,
        );

        self.handshake(cancel, handle, client).await
    }

    async fn start_http(&self, cancel: CancellationToken, handle: &Arc<ChildHandle>) -> Result<()> {
        let ServerConfig::StreamableHttp {
            url,
            bearer_token_env_var,
            env,
            ..
        } = handle.config()
        else {
            bail!("server '{}' is not a streamable-http server", handle.name());
        };

        let client: Arc<dyn UpstreamClient> = Arc::new(
            HttpClient::new(handle.name(), url, bearer_token_env_var.as_deref(), env)
                .with_context(|| format!("failed to build HTTP client for '{}'", handle.name()))?,
        );
        handle.mark_started();
        handle.set_client(client.clone());

        self.handshake(cancel, handle, client).await
    }

    async fn handshake(
        &self,
        cancel: CancellationToken,
        handle: &Arc<ChildHandle>,
        client: Arc<dyn UpstreamClient>,
    ) -> Result<()> {
        let init = client
            .initialize(cancel.clone(), self.client_info.clone())
            .await
            .with_context(|| format!("MCP handshake with '{}' failed", handle.name()))?;
        tracing::debug!(
            server = %handle.name(),
            upstream = %init.server_info.name,
            version = %init.server_info.version,
            "handshake complete"
        );

        let tools = client
            .list_tools(cancel)
            .await
            .with_context(|| format!("initial tools/list for '{}' failed", handle.name()))?;
        self.events.publish(Event::ToolsUpdated {
            server: handle.name().to_string(),
            count: tools.len(),
        });
        handle.set_tools(tools);
        Ok(())
    }

    /// Graceful stop; a handle that is not running is a successful no-op.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let Some(handle) = self.get(name) else {
            return Ok(());
        };
        stop_child(self.events.clone(), self.pid_tracker.clone(), handle).await;
        Ok(())
    }

    /// Stop every child concurrently and wait for all of them to reach a
    /// terminal state.
    pub async fn stop_all(&self) {
        let mut set = JoinSet::new();
        for handle in self.list() {
            set.spawn(stop_child(
                self.events.clone(),
                self.pid_tracker.clone(),
                handle,
            ));
        }
        while set.join_next().await.is_some() {}
    }
}

async fn stop_child(
    events: Arc<EventBus>,
    pid_tracker: Option<Arc<PidTracker>>,
    handle: Arc<ChildHandle>,
) {
    // Wait out a concurrent stop rather than doubling the signals.
    if handle.state() == ChildState::Stopping {
        await_terminal(&handle, GRACEFUL_STOP_TIMEOUT).await;
        return;
    }

    let Some(old) = handle.transition(ChildState::Stopping) else {
        return; // already terminal
    };
    events.publish(Event::StatusChanged {
        server: handle.name().to_string(),
        old,
        new: ChildState::Stopping,
        error: None,
    });

    // Polite shutdown first: closing the client closes the child's stdin.
    if let Some(client) = handle.client() {
        client.close().await;
    }

    if handle.config().is_stdio() {
        if let Some(pid) = handle.pid() {
            signal_group(pid, libc::SIGTERM);
        }
        if !await_terminal(&handle, GRACEFUL_STOP_TIMEOUT).await {
            tracing::warn!(server = %handle.name(), "graceful stop timed out; killing process group");
            if let Some(pid) = handle.pid() {
                signal_group(pid, libc::SIGKILL);
            }
            if !await_terminal(&handle, KILL_CONFIRM_TIMEOUT).await {
                // The exit watcher never confirmed; force the state so the
                // supervisor's view stays consistent.
                if let Some(old) = handle.transition(ChildState::Stopped) {
                    events.publish(Event::StatusChanged {
                        server: handle.name().to_string(),
                        old,
                        new: ChildState::Stopped,
                        error: None,
                    });
                }
            }
        }
    } else if let Some(old) = handle.transition(ChildState::Stopped) {
        events.publish(Event::StatusChanged {
            server: handle.name().to_string(),
            old,
            new: ChildState::Stopped,
            error: None,
        });
    }

    if let Some(tracker) = &pid_tracker {
        tracker.clear(handle.name());
    }
    tracing::info!(server = %handle.name(), "upstream server stopped");
}

/// True once the handle reached a terminal state within `timeout`.
async fn await_terminal(handle: &ChildHandle, timeout: Duration) -> bool {
    let mut state = handle.watch_state();
    tokio::time::timeout(timeout, async {
        loop {
            if state.borrow_and_update().is_terminal() {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok()
}

fn spawn_stderr_pump(
    handle: Arc<ChildHandle>,
    events: Arc<EventBus>,
    stderr: tokio::process::ChildStderr,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            handle.logs().push(line.clone());
            events.publish(Event::LogLine {
                server: handle.name().to_string(),
                line,
            });
        }
    });
}

/// Owns `child.wait()`. An exit observed while Running is an unexpected
/// failure; while Stopping it completes the graceful stop.
fn spawn_exit_watcher(
    handle: Arc<ChildHandle>,
    events: Arc<EventBus>,
    pid_tracker: Option<Arc<PidTracker>>,
    mut child: tokio::process::Child,
) {
    tokio::spawn(async move {
        let status = child.wait().await;
        let describe = match &status {
            Ok(status) => status.to_string(),
            Err(error) => format!("wait failed: {error}"),
        };

        let (target, error) = match handle.state() {
            ChildState::Running => (
                ChildState::Failed,
                Some(format!("exited unexpectedly ({describe})")),
            ),
            ChildState::Stopping => (ChildState::Stopped, None),
            other => {
                tracing::debug!(server = %handle.name(), state = other.label(), status = %describe, "child exited");
                return;
            }
        };

        if let Some(old) = handle.transition(target) {
            if target == ChildState::Failed {
                tracing::warn!(server = %handle.name(), status = %describe, "upstream server exited unexpectedly");
            }
            events.publish(Event::StatusChanged {
                server: handle.name().to_string(),
                old,
                new: target,
                error,
            });
        }
        if let Some(tracker) = &pid_tracker {
            tracker.clear(handle.name());
        }
    });
}

fn signal_group(pid: u32, signal: i32) {
    #[cfg(unix)]
    {
        // Negative pid addresses the process group created by setsid.
        // SAFETY: kill with a signal argument has no other preconditions.
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
