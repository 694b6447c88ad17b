//! NDJSON MCP client over a child process's stdin/stdout.
//!
//! Outbound writes are serialized behind one mutex; a reader task
//! demultiplexes inbound responses by request id into per-request oneshot
//! channels, so concurrent callers never see each other's replies.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::UpstreamClient;
use crate::error::ClientError;
use crate::protocol::{
    ClientInfo, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION, ServerMessage, ToolCallOutcome, ToolsListResult, UpstreamTool,
};

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

pub struct StdioClient {
    server_name: String,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    /// Waiters keyed by request id.
    pending: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    /// Ids whose waiter was cancelled; a late response is dropped silently.
    abandoned: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    disconnected: AtomicBool,
}

impl StdioClient {
    /// Wrap a child's stdio pair and start the reader task.
    pub fn spawn<R, W>(server_name: &str, stdout: R, stdin: W) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let client = Arc::new(Self {
            server_name: server_name.to_string(),
            writer: tokio::sync::Mutex::new(Some(Box::new(stdin) as BoxedWriter)),
            pending: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            disconnected: AtomicBool::new(false),
        });

        let reader_client = client.clone();
        tokio::spawn(async move {
            reader_client.reader_loop(BufReader::new(stdout)).await;
        });

        client
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Acquire)
    }

    async fn request(
        &self,
        cancel: CancellationToken,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, tx);

        if let Err(error) = self
            .write_line(&JsonRpcRequest::new(id, method, params))
            .await
        {
            self.pending.lock().expect("pending map poisoned").remove(&id);
            return Err(error);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.abandon(id);
                Err(ClientError::Cancelled)
            }
            response = rx => match response {
                Ok(response) => Ok(response.into_result()?),
                Err(_) => Err(ClientError::Disconnected),
            },
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }
        self.write_line(&JsonRpcNotification::new(method, params))
            .await
    }

    async fn write_line<T: serde::Serialize>(&self, message: &T) -> Result<(), ClientError> {
        let line = serde_json::to_string(message)?;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ClientError::Disconnected);
        };

        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(error) = result {
            drop(guard);
            self.mark_disconnected();
            return Err(error.into());
        }
        Ok(())
    }

    fn abandon(&self, id: u64) {
        self.pending.lock().expect("pending map poisoned").remove(&id);
        self.abandoned
            .lock()
            .expect("abandoned set poisoned")
            .insert(id);
    }

    fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.pending.lock().expect("pending map poisoned").clear();
    }

    async fn reader_loop<R>(&self, mut reader: BufReader<R>)
    where
        R: AsyncRead + Unpin,
    {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    tracing::debug!(server = %self.server_name, "upstream closed stdout");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    self.dispatch_line(trimmed);
                }
                Err(error) => {
                    tracing::warn!(server = %self.server_name, error = %error, "upstream read failed");
                    break;
                }
            }
        }
        self.mark_disconnected();
    }

    fn dispatch_line(&self, line: &str) {
        match ServerMessage::from_line(line) {
            Ok(ServerMessage::Response(response)) => {
                let Some(id) = response.id_u64() else {
                    tracing::debug!(server = %self.server_name, "response with non-numeric id dropped");
                    return;
                };
                let waiter = self.pending.lock().expect("pending map poisoned").remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        let was_abandoned = self
                            .abandoned
                            .lock()
                            .expect("abandoned set poisoned")
                            .remove(&id);
                        if was_abandoned {
                            tracing::debug!(server = %self.server_name, id, "late response for abandoned request dropped");
                        } else {
                            tracing::debug!(server = %self.server_name, id, "response for unknown request id dropped");
                        }
                    }
                }
            }
            Ok(ServerMessage::Notification { method, .. }) => {
                tracing::debug!(server = %self.server_name, method = %method, "upstream notification ignored");
            }
            Err(error) => {
                tracing::warn!(server = %self.server_name, error = %error, "unparseable upstream line dropped");
            }
        }
    }
}

#[async_trait]
impl UpstreamClient for StdioClient {
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

        if init.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                server = %self.server_name,
                offered = %init.protocol_version,
                supported = PROTOCOL_VERSION,
                "upstream negotiated a different protocol version"
            );
        }

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
        self.disconnected.store(true, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.pending.lock().expect("pending map poisoned").clear();
    }
}

#[cfg(test)]
#[path = "stdio_tests.rs"]
mod tests;
