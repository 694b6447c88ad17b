use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use fleet_client::UpstreamTool;
use fleet_config::Config;
use fleet_supervisor::Supervisor;

use crate::manager;

/// Upper bound on concurrent per-server discoveries.
const DISCOVERY_CONCURRENCY: usize = 4;
/// Per-server discovery deadline, including a lazy start.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One tool as exposed to the downstream client, under its qualified name.
#[derive(Debug, Clone)]
pub struct AggregatedTool {
    pub qualified_name: String,
    pub description: String,
    pub input_schema: Value,
    server_name: String,
    original_name: String,
}

impl AggregatedTool {
    fn from_upstream(server: &str, tool: UpstreamTool) -> Self {
        Self {
            qualified_name: format!("{server}.{}", tool.name),
            description: format!("[{server}] {}", tool.description),
            input_schema: tool.input_schema,
            server_name: server.to_string(),
            original_name: tool.name,
        }
    }

    pub(crate) fn manager(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            qualified_name: format!("{}.{name}", fleet_config::MANAGER_PREFIX),
            description: description.to_string(),
            input_schema,
            server_name: String::new(),
            original_name: name.to_string(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    /// Manager tools are the ones the aggregator implements itself.
    pub fn is_manager(&self) -> bool {
        self.server_name.is_empty()
    }
}

/// Qualified-name tool cache over the active upstream set.
pub struct Aggregator {
    config: Arc<Config>,
    supervisor: Arc<Supervisor>,
    tools: RwLock<HashMap<String, AggregatedTool>>,
    manager_tools: Vec<AggregatedTool>,
}

impl Aggregator {
    pub fn new(config: Arc<Config>, supervisor: Arc<Supervisor>) -> Arc<Self> {
        Arc::new(Self {
            config,
            supervisor,
            tools: RwLock::new(HashMap::new()),
            manager_tools: manager::tool_definitions(),
        })
    }

    pub fn manager_tools(&self) -> &[AggregatedTool] {
        &self.manager_tools
    }

    pub fn cached(&self, qualified_name: &str) -> Option<AggregatedTool> {
        self.tools
            .read()
            .expect("tool cache poisoned")
            .get(qualified_name)
            .cloned()
    }

    /// Discover tools across `server_names` with bounded parallelism,
    /// starting servers that are not yet running. A failing server is
    /// logged and skipped; it never poisons the aggregate. The cache is
    /// replaced wholesale, and manager tools are appended to the returned
    /// list.
    pub async fn list_tools(
        &self,
        cancel: CancellationToken,
        server_names: &[String],
    ) -> Vec<AggregatedTool> {
        let semaphore = Arc::new(Semaphore::new(DISCOVERY_CONCURRENCY));
        let mut discoveries = JoinSet::new();

        for name in server_names {
            let Some(server_config) = self.config.servers.get(name).cloned() else {
                tracing::warn!(server = %name, "active server missing from config; skipping discovery");
                continue;
            };
            if !server_config.enabled() {
                tracing::debug!(server = %name, "server disabled; skipping discovery");
                continue;
            }

            let name = name.clone();
            let supervisor = self.supervisor.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            discoveries.spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                match tokio::time::timeout(
                    DISCOVERY_TIMEOUT,
                    supervisor.start(cancel, &name, &server_config),
                )
                .await
                {
                    Ok(Ok(handle)) => Some((name, handle.tools())),
                    Ok(Err(error)) => {
                        tracing::warn!(server = %name, error = %format!("{error:#}"), "tool discovery failed; skipping");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(
                            server = %name,
                            timeout_secs = DISCOVERY_TIMEOUT.as_secs(),
                            "tool discovery timed out; skipping"
                        );
                        None
                    }
                }
            });
        }

        let mut fresh = HashMap::new();
        while let Some(result) = discoveries.join_next().await {
            let Ok(Some((server, tools))) = result else {
                continue;
            };
            for tool in tools {
                let aggregated = AggregatedTool::from_upstream(&server, tool);
                fresh.insert(aggregated.qualified_name.clone(), aggregated);
            }
        }

        let mut listed: Vec<AggregatedTool> = fresh.values().cloned().collect();
        listed.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        *self.tools.write().expect("tool cache poisoned") = fresh;

        listed.extend(self.manager_tools.iter().cloned());
        listed
    }

    /// Drop every cached entry owned by `server` and repopulate from that
    /// server's handle alone. Returns the number of tools now cached for
    /// it.
    pub fn refresh_server_tools(&self, server: &str) -> usize {
        let tools = self
            .supervisor
            .get(server)
            .filter(|handle| handle.state().is_running())
            .map(|handle| handle.tools())
            .unwrap_or_default();

        let mut cache = self.tools.write().expect("tool cache poisoned");
        cache.retain(|_, tool| tool.server_name() != server);
        let count = tools.len();
        for tool in tools {
            let aggregated = AggregatedTool::from_upstream(server, tool);
            cache.insert(aggregated.qualified_name.clone(), aggregated);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[tokio::test]
    async fn discovery_qualifies_names_and_rewrites_descriptions() {
        let temp = tempfile::tempdir().unwrap();
        let script = testutil::write_mock_server(temp.path());
        let config = Arc::new(testutil::config_with_servers(&[("alpha", &script)]));
        let supervisor = testutil::supervisor();
        let aggregator = Aggregator::new(config, supervisor.clone());

        let tools = aggregator
            .list_tools(CancellationToken::new(), &["alpha".to_string()])
            .await;

        let read = tools
            .iter()
            .find(|tool| tool.qualified_name == "alpha.read_file")
            .expect("alpha.read_file present");
        assert_eq!(read.description, "[alpha] read");
        assert_eq!(read.server_name(), "alpha");
        assert_eq!(read.original_name(), "read_file");
        assert!(!read.is_manager());

        // Manager tools ride along at the end of the listing.
        assert!(
            tools
                .iter()
                .any(|tool| tool.qualified_name == "fleet.servers_list")
        );

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn one_bad_server_does_not_poison_the_aggregate() {
        let temp = tempfile::tempdir().unwrap();
        let script = testutil::write_mock_server(temp.path());
        let mut config = testutil::config_with_servers(&[("good", &script)]);
        config.servers.insert(
            "bad".to_string(),
            testutil::stdio_command("__mcp_fleet_no_such_binary__"),
        );
        let config = Arc::new(config);
        let supervisor = testutil::supervisor();
        let aggregator = Aggregator::new(config, supervisor.clone());

        let tools = aggregator
            .list_tools(
                CancellationToken::new(),
                &["good".to_string(), "bad".to_string()],
            )
            .await;

        assert!(tools.iter().any(|t| t.qualified_name == "good.read_file"));
        assert!(!tools.iter().any(|t| t.server_name() == "bad"));

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn refresh_evicts_only_the_named_server() {
        let temp = tempfile::tempdir().unwrap();
        let script = testutil::write_mock_server(temp.path());
        let config = Arc::new(testutil::config_with_servers(&[
            ("alpha", &script),
            ("beta", &script),
        ]));
        let supervisor = testutil::supervisor();
        let aggregator = Aggregator::new(config, supervisor.clone());

        aggregator
            .list_tools(
                CancellationToken::new(),
                &["alpha".to_string(), "beta".to_string()],
            )
            .await;
        assert!(aggregator.cached("alpha.read_file").is_some());
        assert!(aggregator.cached("beta.read_file").is_some());

        supervisor.stop("alpha").await.unwrap();
        let count = aggregator.refresh_server_tools("alpha");
        assert_eq!(count, 0, "stopped server repopulates nothing");
        assert!(aggregator.cached("alpha.read_file").is_none());
        assert!(aggregator.cached("beta.read_file").is_some());

        supervisor.stop_all().await;
    }
}
