//! Streamable HTTP MCP client.
//!
//! Each JSON-RPC message is POSTed to the endpoint; single-response
//! `text/event-stream` bodies are unwrapped so servers may answer in
//! either framing. The session id handed out at `initialize` is echoed on
//! every subsequent request.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Value, json};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::UpstreamClient;
use crate::error::ClientError;
use crate::protocol::{
    ClientInfo, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION, ToolCallOutcome, ToolsListResult, UpstreamTool,
};

const SESSION_HEADER: &str = "Mcp-Session-Id";
const ACCEPT_VALUE: &str = "application/json, text/event-stream";

pub struct HttpClient {
    server_name: String,
    url: String,
    http: reqwest::Client,
    bearer: Option<String>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpClient {
    /// Build a client for `url`. The bearer token is resolved at
    /// construction from the server's configured `env` overlay first, then
    /// the process environment; an unset or empty var only warns, since
    /// the endpoint may not require auth.
    pub fn new(
        server_name: &str,
        url: &str,
        bearer_token_env_var: Option<&str>,
        env_overlay: &std::collections::HashMap<String, String>,
    ) -> Result<Self, ClientError> {
        let bearer = bearer_token_env_var.and_then(|var| {
            let token = env_overlay
                .get(var)
                .cloned()
                .or_else(|| std::env::var(var).ok())
                .filter(|token| !token.is_empty());
            if token.is_none() {
                tracing::warn!(server = %server_name, env_var = %var, "bearer token env var is not set");
            }
            token
        });

        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            server_name: server_name.to_string(),
            url: url.to_string(),
            http,
            bearer,
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    async fn post(
        &self,
        cancel: CancellationToken,
        body: Value,
    ) -> Result<Option<Value>, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Disconnected);
        }

        let mut request = self
            .http
            .post(&self.url)
            .header(ACCEPT, ACCEPT_VALUE)
            .header(CONTENT_TYPE, "application/json");
        if let Some(bearer) = &self.bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {bearer}"));
        }
        if let Some(session) = self.session_id.lock().expect("session id poisoned").clone() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            response = request.json(&body).send() => response?,
        };

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self.session_id.lock().expect("session id poisoned") = Some(session.to_string());
        }

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED || status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ClientError::Http(format!(
                "endpoint returned HTTP {status} for '{}'",
                self.server_name
            )));
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            text = response.text() => text?,
        };

        if is_event_stream {
            let events = parse_sse_data(&text);
            if events.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Value::Array(events)));
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }

    async fn request(
        &self,
        cancel: CancellationToken,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_value(&request)?;

        let Some(payload) = self.post(cancel, body).await? else {
            return Err(ClientError::Protocol(format!(
                "no response body for '{method}'"
            )));
        };

        let response = find_response(payload, id).ok_or_else(|| {
            ClientError::Protocol(format!("no response matching request id {id} for '{method}'"))
        })?;
        Ok(response.into_result()?)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let notification = JsonRpcNotification::new(method, params);
        let body = serde_json::to_value(&notification)?;
        self.post(CancellationToken::new(), body).await?;
        Ok(())
    }
}

/// Pick the response with the expected id out of a body that may be a bare
/// response or an array of SSE-delivered messages.
fn find_response(payload: Value, id: u64) -> Option<JsonRpcResponse> {
    let candidates = match payload {
        Value::Array(items) => items,
        other => vec![other],
    };
    candidates
        .into_iter()
        .filter_map(|value| serde_json::from_value::<JsonRpcResponse>(value).ok())
        .find(|response| response.id_u64() == Some(id))
}

/// Extract `data:` payloads from an SSE body, parsed as JSON.
fn parse_sse_data(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str(data.trim()).ok())
        .collect()
}

#[async_trait]
impl UpstreamClient for HttpClient {
    async fn initialize(
        &self,
        cancel: CancellationToken,
        client_info: ClientInfo,
    ) -> Result<InitializeResult, ClientError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": client_info,
        });
        let result = self.request(cancel, "initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)?;
        self.notify("notifications/initialized", None).await?;
        Ok(init)
    }

    async fn list_tools(&self, cancel: CancellationToken) -> Result<Vec<UpstreamTool>, ClientError> {
        let result = self.request(cancel, "tools/list", None).await?;
        let list: ToolsListResult = serde_json::from_value(result)?;
        Ok(list.tools)
    }

    async fn call_tool(
        &self,
        cancel: CancellationToken,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallOutcome, ClientError> {
        let params = json!({"name": name, "arguments": arguments});
        let result = self.request(cancel, "tools/call", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Best-effort session teardown per the streamable HTTP transport.
        let session = self.session_id.lock().expect("session id poisoned").take();
        if let Some(session) = session {
            let mut request = self.http.delete(&self.url).header(SESSION_HEADER, session);
            if let Some(bearer) = &self.bearer {
                request = request.header(AUTHORIZATION, format!("Bearer {bearer}"));
            }
            if let Err(error) = request.send().await {
                tracing::debug!(server = %self.server_name, error = %error, "session teardown request failed");
            }
        }
    }
}
