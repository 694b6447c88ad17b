//! Upstream MCP client capability.
//!
//! One client per upstream server, with a transport-specific
//! implementation behind the [`UpstreamClient`] trait: NDJSON over a
//! child's stdio, or streamable HTTP against a remote endpoint. Everything
//! above this crate is transport-agnostic.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

mod error;
mod http;
pub mod protocol;
mod stdio;

pub use error::ClientError;
pub use http::HttpClient;
pub use protocol::{
    ClientInfo, InitializeResult, JsonRpcError, PROTOCOL_VERSION, ServerInfo, ToolCallOutcome,
    UpstreamTool,
};
pub use stdio::StdioClient;

/// Per-server MCP client contract.
///
/// Every call takes a cancellation token and surrenders promptly when it
/// fires; timeouts are the caller's concern.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Complete the MCP handshake (`initialize` + `notifications/initialized`).
    async fn initialize(
        &self,
        cancel: CancellationToken,
        client_info: ClientInfo,
    ) -> Result<InitializeResult, ClientError>;

    /// Discover the server's tools via `tools/list`.
    async fn list_tools(&self, cancel: CancellationToken) -> Result<Vec<UpstreamTool>, ClientError>;

    /// Forward a `tools/call`. Upstream `isError=true` content is a
    /// successful outcome with the flag set, not an `Err`.
    async fn call_tool(
        &self,
        cancel: CancellationToken,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallOutcome, ClientError>;

    /// Idempotent shutdown of the transport.
    async fn close(&self);
}
