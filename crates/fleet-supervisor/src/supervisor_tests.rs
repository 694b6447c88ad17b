use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use fleet_config::ServerConfig;

use super::Supervisor;
use crate::events::{Event, EventBus};
use crate::handle::ChildState;
use crate::pidtrack::PidTracker;

/// Minimal MCP server as a shell script: answers the handshake and
/// `tools/list`, logs one line to stderr at boot, and exits on EOF.
fn write_script(dir: &Path) -> std::path::PathBuf {
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
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"read_file","description":"read","inputSchema":{"type":"object"}},{"name":"write_file","description":"write","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"ok"}],"isError":false}}\n' "$id"
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

fn stdio_config(script: &Path) -> ServerConfig {
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

fn supervisor() -> Arc<Supervisor> {
    Supervisor::new(Arc::new(EventBus::default()), None)
}

async fn wait_for_state(
    handle: &crate::handle::ChildHandle,
    wanted: ChildState,
    timeout: Duration,
) -> bool {
    let mut state = handle.watch_state();
    tokio::time::timeout(timeout, async {
        loop {
            if *state.borrow_and_update() == wanted {
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

#[tokio::test]
async fn start_runs_handshake_and_caches_tools() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_script(temp.path());
    let supervisor = supervisor();

    let handle = supervisor
        .start(CancellationToken::new(), "mock", &stdio_config(&script))
        .await
        .unwrap();

    assert_eq!(handle.state(), ChildState::Running);
    assert!(handle.pid().is_some());
    assert!(handle.uptime().is_some());
    let tools: Vec<String> = handle.tools().into_iter().map(|t| t.name).collect();
    assert_eq!(tools, vec!["read_file", "write_file"]);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn start_is_idempotent_for_a_running_child() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_script(temp.path());
    let supervisor = supervisor();
    let config = stdio_config(&script);

    let first = supervisor
        .start(CancellationToken::new(), "mock", &config)
        .await
        .unwrap();
    let second = supervisor
        .start(CancellationToken::new(), "mock", &config)
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(supervisor.list().len(), 1);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn stderr_lines_land_in_the_log_ring() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_script(temp.path());
    let supervisor = supervisor();

    let handle = supervisor
        .start(CancellationToken::new(), "mock", &stdio_config(&script))
        .await
        .unwrap();

    // The pump runs concurrently with the handshake; give it a beat.
    let mut logged = false;
    for _ in 0..50 {
        if !handle.logs().is_empty() {
            logged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(logged, "expected boot line in log ring");
    assert_eq!(handle.logs().snapshot()[0], "mock server booted");

    supervisor.stop_all().await;
}

#[tokio::test]
async fn stop_is_graceful_and_idempotent() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_script(temp.path());
    let supervisor = supervisor();

    let handle = supervisor
        .start(CancellationToken::new(), "mock", &stdio_config(&script))
        .await
        .unwrap();

    supervisor.stop("mock").await.unwrap();
    assert_eq!(handle.state(), ChildState::Stopped);

    // Stopping again (and stopping an unknown server) is a no-op.
    supervisor.stop("mock").await.unwrap();
    supervisor.stop("never-started").await.unwrap();
}

#[tokio::test]
async fn status_events_are_published_on_the_bus() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_script(temp.path());
    let events = Arc::new(EventBus::default());
    let mut rx = events.subscribe();
    let supervisor = Supervisor::new(events, None);

    supervisor
        .start(CancellationToken::new(), "mock", &stdio_config(&script))
        .await
        .unwrap();
    supervisor.stop("mock").await.unwrap();

    let mut transitions = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::StatusChanged { new, .. } = event {
            transitions.push(new);
        }
    }
    assert_eq!(
        transitions,
        vec![
            ChildState::Starting,
            ChildState::Running,
            ChildState::Stopping,
            ChildState::Stopped,
        ]
    );
}

#[tokio::test]
async fn unexpected_exit_marks_the_handle_failed() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_script(temp.path());
    let supervisor = supervisor();

    let handle = supervisor
        .start(CancellationToken::new(), "mock", &stdio_config(&script))
        .await
        .unwrap();
    let pid = handle.pid().unwrap();

    // Kill the child behind the supervisor's back.
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }

    assert!(
        wait_for_state(&handle, ChildState::Failed, Duration::from_secs(5)).await,
        "exit watcher should mark the handle failed"
    );
}

#[tokio::test]
async fn restart_after_failure_creates_a_fresh_handle() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_script(temp.path());
    let supervisor = supervisor();
    let config = stdio_config(&script);

    let first = supervisor
        .start(CancellationToken::new(), "mock", &config)
        .await
        .unwrap();
    let pid = first.pid().unwrap();
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    assert!(wait_for_state(&first, ChildState::Failed, Duration::from_secs(5)).await);

    let second = supervisor
        .start(CancellationToken::new(), "mock", &config)
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.state(), ChildState::Running);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn spawn_failure_reports_error_and_failed_state() {
    let supervisor = supervisor();
    let config = ServerConfig::Stdio {
        command: "__mcp_fleet_no_such_binary__".to_string(),
        args: Vec::new(),
        cwd: None,
        env: HashMap::new(),
        enabled: None,
        autostart: false,
        tool_timeout: None,
    };

    let error = supervisor
        .start(CancellationToken::new(), "ghost", &config)
        .await
        .unwrap_err();
    assert!(format!("{error:#}").contains("failed to spawn"));

    let handle = supervisor.get("ghost").unwrap();
    assert_eq!(handle.state(), ChildState::Failed);
}

#[tokio::test]
async fn handshake_failure_kills_the_child() {
    let temp = tempfile::tempdir().unwrap();
    // A child that answers nothing: handshake hits EOF when it exits.
    let path = temp.path().join("silent.sh");
    fs::write(&path, "#!/bin/sh\nread -r _line\nexit 1\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    let supervisor = supervisor();
    let error = supervisor
        .start(CancellationToken::new(), "silent", &stdio_config(&path))
        .await
        .unwrap_err();
    assert!(format!("{error:#}").contains("handshake"));
    assert_eq!(supervisor.get("silent").unwrap().state(), ChildState::Failed);
}

#[tokio::test]
async fn stop_all_stops_every_child() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_script(temp.path());
    let supervisor = supervisor();

    for name in ["a", "b", "c"] {
        supervisor
            .start(CancellationToken::new(), name, &stdio_config(&script))
            .await
            .unwrap();
    }
    assert_eq!(supervisor.list().len(), 3);

    supervisor.stop_all().await;
    for handle in supervisor.list() {
        assert!(handle.state().is_terminal());
    }
}

#[tokio::test]
async fn pid_tracker_records_and_clears() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_script(temp.path());
    let pid_dir = temp.path().join("pids");
    let tracker = PidTracker::new(pid_dir.clone()).unwrap();
    let supervisor = Supervisor::new(Arc::new(EventBus::default()), Some(tracker));

    supervisor
        .start(CancellationToken::new(), "mock", &stdio_config(&script))
        .await
        .unwrap();
    assert!(pid_dir.join("mock.pid").exists());

    supervisor.stop("mock").await.unwrap();
    assert!(!pid_dir.join("mock.pid").exists());
}
