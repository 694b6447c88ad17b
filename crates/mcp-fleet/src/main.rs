use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod cli;

use cli::{Cli, Commands};
use fleet_supervisor::{Event, EventBus, PidTracker, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .try_init()
        .ok();

    match cli.command {
        Commands::Serve {
            config,
            namespace,
            eager_start,
            pid_dir,
            no_watch,
        } => serve(config, namespace, eager_start, pid_dir, no_watch).await,
        Commands::Validate { config } => validate(config),
    }
}

async fn serve(
    config_override: Option<PathBuf>,
    namespace: Option<String>,
    eager_start: bool,
    pid_dir: Option<PathBuf>,
    no_watch: bool,
) -> Result<()> {
    let config_path = config_override.unwrap_or_else(fleet_config::default_config_path);
    let config = fleet_config::load_from_path(&config_path)?;
    tracing::info!(
        path = %config_path.display(),
        servers = config.servers.len(),
        namespaces = config.namespaces.len(),
        "config loaded"
    );

    let events = Arc::new(EventBus::default());
    let _event_log = events.subscribe_fn(|event| match event {
        Event::StatusChanged {
            server, old, new, ..
        } => {
            tracing::debug!(server = %server, from = old.label(), to = new.label(), "server state changed");
        }
        Event::Error { server, message } => {
            tracing::debug!(server = %server, message = %message, "server error event");
        }
        _ => {}
    });

    let pid_tracker = match pid_dir {
        Some(dir) => Some(PidTracker::new(dir)?),
        None => None,
    };
    let supervisor = Supervisor::new(events.clone(), pid_tracker);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let reload_rx = if no_watch {
        None
    } else {
        match fleet_serve::spawn_reload_watcher(config_path.clone(), cancel.clone()) {
            Ok(rx) => Some(rx),
            Err(error) => {
                tracing::warn!(error = %format!("{error:#}"), "config watching disabled");
                None
            }
        }
    };

    let options = fleet_serve::ServeOptions {
        namespace,
        eager_start,
        ..fleet_serve::ServeOptions::default()
    };

    let result = fleet_serve::run(
        cancel,
        config,
        supervisor,
        options,
        tokio::io::stdin(),
        tokio::io::stdout(),
        reload_rx,
    )
    .await;

    events.close();
    result
}

fn validate(config_override: Option<PathBuf>) -> Result<()> {
    let config_path = config_override.unwrap_or_else(fleet_config::default_config_path);
    let config = fleet_config::load_from_path(&config_path)
        .with_context(|| format!("config validation failed: {}", config_path.display()))?;

    println!(
        "{}: ok ({} server(s), {} namespace(s), {} permission rule(s))",
        config_path.display(),
        config.servers.len(),
        config.namespaces.len(),
        config.tool_permissions.len()
    );
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(error) => {
                        tracing::warn!(error = %error, "failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        cancel.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("termination signal received");
        cancel.cancel();
    });
}
