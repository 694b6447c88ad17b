//! The serve-mode runtime: tool aggregation across the active upstream
//! set, qualified-name routing with namespace permissions, manager tools,
//! hot config reload, and the NDJSON JSON-RPC session on stdin/stdout.

mod aggregator;
mod errors;
mod manager;
mod namespace;
mod reload;
mod router;
mod server;
#[cfg(test)]
mod testutil;

pub use aggregator::{AggregatedTool, Aggregator};
pub use errors::RpcError;
pub use namespace::{ActiveSelection, SelectionMethod, resolve};
pub use reload::spawn_reload_watcher;
pub use router::Router;
pub use server::{ServeOptions, run};
