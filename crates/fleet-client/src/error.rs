use crate::protocol::JsonRpcError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("upstream error: {0}")]
    Rpc(#[from] JsonRpcError),

    #[error("upstream connection closed")]
    Disconnected,

    #[error("request cancelled")]
    Cancelled,

    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_upstream_code_and_message() {
        let err = ClientError::Rpc(JsonRpcError {
            code: -32601,
            message: "Method not found".to_string(),
            data: None,
        });
        let text = err.to_string();
        assert!(text.contains("-32601"), "{text}");
        assert!(text.contains("Method not found"), "{text}");
    }
}
