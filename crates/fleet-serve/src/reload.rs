//! Hot-reload controller: watch the config file's parent directory,
//! debounce the event storm editors produce, and hand parsed snapshots to
//! the serve loop.

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fleet_config::Config;

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(150);

/// Start watching `config_path` for changes. Watching the parent
/// directory (filtered by file name) survives atomic-rename editors that
/// replace the file instead of writing it in place.
///
/// The returned channel has capacity 1; a snapshot that arrives while one
/// is already queued is dropped, and the next filesystem event produces a
/// fresh parse.
pub fn spawn_reload_watcher(
    config_path: PathBuf,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<Arc<Config>>> {
    let watch_dir = parent_dir(&config_path);
    let file_name = config_path
        .file_name()
        .map(|name| name.to_os_string())
        .context("config path has no file name")?;

    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<()>();
    let handler_file_name = file_name.clone();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let Ok(event) = event else {
            return;
        };
        if event.kind.is_access() {
            return;
        }
        let touches_config = event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(handler_file_name.as_os_str()));
        if touches_config {
            let _ = raw_tx.send(());
        }
    })
    .context("failed to create config watcher")?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", watch_dir.display()))?;
    tracing::debug!(dir = %watch_dir.display(), "watching config directory for changes");

    let (reload_tx, reload_rx) = mpsc::channel::<Arc<Config>>(1);
    tokio::spawn(debounce_loop(
        watcher,
        config_path,
        raw_rx,
        reload_tx,
        cancel,
    ));

    Ok(reload_rx)
}

async fn debounce_loop(
    _watcher: notify::RecommendedWatcher,
    config_path: PathBuf,
    mut raw_rx: mpsc::UnboundedReceiver<()>,
    reload_tx: mpsc::Sender<Arc<Config>>,
    cancel: CancellationToken,
) {
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let debounce_fire = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            event = raw_rx.recv() => match event {
                Some(()) => {
                    deadline = Some(tokio::time::Instant::now() + RELOAD_DEBOUNCE);
                }
                None => break,
            },
            _ = debounce_fire => {
                deadline = None;
                match fleet_config::load_from_path(&config_path) {
                    Ok(config) => {
                        tracing::info!(path = %config_path.display(), "config change detected");
                        if reload_tx.try_send(config).is_err() {
                            tracing::debug!("reload channel full; snapshot dropped");
                        }
                    }
                    Err(error) => {
                        // Partial writes and bad edits keep the running config.
                        tracing::warn!(
                            path = %config_path.display(),
                            error = %format!("{error:#}"),
                            "ignoring unparseable config change"
                        );
                    }
                }
            }
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
