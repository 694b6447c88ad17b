use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use fleet_client::{UpstreamClient, UpstreamTool};
use fleet_config::ServerConfig;

use crate::logring::LogRing;

/// Child lifecycle. `Stopped` and `Failed` are terminal; a fresh handle is
/// created on the next start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ChildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// One supervised upstream server: state machine, cached tool list, log
/// ring, and the transport client once the handshake completed.
pub struct ChildHandle {
    name: String,
    config: ServerConfig,
    state: watch::Sender<ChildState>,
    pid: Mutex<Option<u32>>,
    started_at: Mutex<Option<(Instant, DateTime<Utc>)>>,
    tools: std::sync::RwLock<Vec<UpstreamTool>>,
    logs: LogRing,
    client: Mutex<Option<Arc<dyn UpstreamClient>>>,
}

impl std::fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildHandle")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("tools", &self.tools)
            .field("logs", &self.logs)
            .field("client", &self.client.lock().expect("handle map poisoned").is_some())
            .finish()
    }
}

impl ChildHandle {
    pub(crate) fn new(name: &str, config: ServerConfig, log_capacity: usize) -> Arc<Self> {
        let (state, _) = watch::channel(ChildState::Starting);
        Arc::new(Self {
            name: name.to_string(),
            config,
            state,
            pid: Mutex::new(None),
            started_at: Mutex::new(None),
            tools: std::sync::RwLock::new(Vec::new()),
            logs: LogRing::new(log_capacity),
            client: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ChildState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions; `Stop` waiters use this to observe
    /// the exit watcher reaching a terminal state.
    pub fn watch_state(&self) -> watch::Receiver<ChildState> {
        self.state.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().expect("pid poisoned")
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.started_at
            .lock()
            .expect("started_at poisoned")
            .map(|(instant, _)| instant.elapsed())
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
            .lock()
            .expect("started_at poisoned")
            .map(|(_, wall)| wall)
    }

    /// Tool list cached at handshake (and refreshed on restart).
    pub fn tools(&self) -> Vec<UpstreamTool> {
        self.tools.read().expect("tools poisoned").clone()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.read().expect("tools poisoned").len()
    }

    pub fn logs(&self) -> &LogRing {
        &self.logs
    }

    pub fn client(&self) -> Option<Arc<dyn UpstreamClient>> {
        self.client.lock().expect("client poisoned").clone()
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock().expect("pid poisoned") = pid;
    }

    pub(crate) fn mark_started(&self) {
        *self.started_at.lock().expect("started_at poisoned") = Some((Instant::now(), Utc::now()));
    }

    pub(crate) fn set_tools(&self, tools: Vec<UpstreamTool>) {
        *self.tools.write().expect("tools poisoned") = tools;
    }

    pub(crate) fn set_client(&self, client: Arc<dyn UpstreamClient>) {
        *self.client.lock().expect("client poisoned") = Some(client);
    }

    /// Replace the state, returning the previous one. Transitions out of a
    /// terminal state are refused; a dead handle never comes back.
    pub(crate) fn transition(&self, new: ChildState) -> Option<ChildState> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == new {
                return false;
            }
            previous = Some(*state);
            *state = new;
            true
        });
        previous
    }
}
