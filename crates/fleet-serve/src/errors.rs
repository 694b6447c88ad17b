use serde_json::{Value, json};

/// JSON-RPC errors returned to the downstream client.
///
/// Codes -32700..-32603 are the standard JSON-RPC set; -32000..-32010 are
/// the aggregator's own taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("server '{server}' failed to start: {reason}")]
    ServerFailedToStart { server: String, reason: String },

    #[error("tool call timed out: {0}")]
    ToolCallTimeout(String),

    #[error("server '{server}' not running: {reason}")]
    ServerNotRunning { server: String, reason: String },

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool '{name}' denied: {reason}")]
    ToolDenied { name: String, reason: String },
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse(_) => -32700,
            Self::InvalidRequest(_) => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::Internal(_) => -32603,
            Self::ServerNotFound(_) => -32000,
            Self::ServerFailedToStart { .. } => -32001,
            Self::ToolCallTimeout(_) => -32002,
            Self::ServerNotRunning { .. } => -32003,
            Self::NamespaceNotFound(_) => -32004,
            Self::ToolNotFound(_) => -32005,
            Self::ToolDenied { .. } => -32010,
        }
    }

    /// Structured context attached to the wire error, where the code has a
    /// natural subject.
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::ServerNotFound(server)
            | Self::ServerFailedToStart { server, .. }
            | Self::ServerNotRunning { server, .. } => Some(json!({"server": server})),
            Self::ToolCallTimeout(name) | Self::ToolNotFound(name) => {
                Some(json!({"tool": name}))
            }
            Self::ToolDenied { name, reason } => {
                Some(json!({"tool": name, "reason": reason}))
            }
            Self::NamespaceNotFound(namespace) => Some(json!({"namespace": namespace})),
            _ => None,
        }
    }

    /// Full JSON-RPC error response for `id`.
    pub fn to_response(&self, id: Value) -> Value {
        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(data) = self.data() {
            error["data"] = data;
        }
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": error,
        })
    }
}
