use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mcpfleet", version)]
#[command(about = "MCP aggregator: one MCP session in front of a fleet of upstream servers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Speak MCP over stdin/stdout, aggregating the configured servers
    Serve {
        /// Config file (default: the platform config dir)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Namespace to activate, overriding defaultNamespace
        #[arg(long)]
        namespace: Option<String>,

        /// Start every active server up front instead of lazily
        #[arg(long)]
        eager_start: bool,

        /// Directory for child pid files, used to clean up orphans after a
        /// crash
        #[arg(long)]
        pid_dir: Option<PathBuf>,

        /// Do not watch the config file for hot reloads
        #[arg(long)]
        no_watch: bool,
    },

    /// Parse and validate a config file, then exit
    Validate {
        /// Config file (default: the platform config dir)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
