use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use super::StdioClient;
use crate::UpstreamClient;
use crate::error::ClientError;
use crate::protocol::ClientInfo;

type ServerSide = (
    BufReader<ReadHalf<DuplexStream>>,
    WriteHalf<DuplexStream>,
);

fn pipe_client() -> (std::sync::Arc<StdioClient>, ServerSide) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let client = StdioClient::spawn("mock", client_read, client_write);
    let (server_read, server_write) = tokio::io::split(server_io);
    (client, (BufReader::new(server_read), server_write))
}

async fn read_request(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> Value {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    serde_json::from_str(line.trim()).unwrap()
}

async fn write_response(writer: &mut WriteHalf<DuplexStream>, id: u64, result: Value) {
    let payload = json!({"jsonrpc": "2.0", "id": id, "result": result});
    let mut line = serde_json::to_string(&payload).unwrap();
    line.push('\n');
    writer.write_all(line.as_bytes()).await.unwrap();
}

#[tokio::test]
async fn concurrent_requests_receive_their_own_responses() {
    let (client, (mut reader, mut writer)) = pipe_client();

    let server = tokio::spawn(async move {
        let first = read_request(&mut reader).await;
        let second = read_request(&mut reader).await;
        let first_id = first["id"].as_u64().unwrap();
        let second_id = second["id"].as_u64().unwrap();

        // Reply out of order; demux must still route each correctly.
        write_response(&mut writer, second_id, json!({"who": "second"})).await;
        write_response(&mut writer, first_id, json!({"who": "first"})).await;
    });

    let cancel = CancellationToken::new();
    let (first, second) = tokio::join!(
        client.request(cancel.clone(), "test/first", None),
        client.request(cancel.clone(), "test/second", None),
    );

    assert_eq!(first.unwrap()["who"], "first");
    assert_eq!(second.unwrap()["who"], "second");
    server.await.unwrap();
}

#[tokio::test]
async fn cancelled_request_abandons_id_and_drops_late_response() {
    let (client, (mut reader, mut writer)) = pipe_client();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = client.request(cancel, "test/slow", None).await;
    assert!(matches!(result, Err(ClientError::Cancelled)));

    let server = tokio::spawn(async move {
        let abandoned = read_request(&mut reader).await;
        let abandoned_id = abandoned["id"].as_u64().unwrap();

        let live = read_request(&mut reader).await;
        let live_id = live["id"].as_u64().unwrap();

        // The late response for the abandoned id must be discarded, not
        // delivered to the next caller.
        write_response(&mut writer, abandoned_id, json!({"who": "stale"})).await;
        write_response(&mut writer, live_id, json!({"who": "live"})).await;
    });

    let result = client
        .request(CancellationToken::new(), "test/next", None)
        .await
        .unwrap();
    assert_eq!(result["who"], "live");
    server.await.unwrap();
}

#[tokio::test]
async fn eof_fails_pending_and_future_requests() {
    let (client, (_reader, writer)) = pipe_client();

    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .request(CancellationToken::new(), "test/hang", None)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    drop(writer);
    drop(_reader);

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ClientError::Disconnected)));

    let result = client
        .request(CancellationToken::new(), "test/after", None)
        .await;
    assert!(matches!(result, Err(ClientError::Disconnected)));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn close_is_idempotent() {
    let (client, _server) = pipe_client();
    client.close().await;
    client.close().await;
    assert!(!client.is_connected());
}

mod child_process {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write_script(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("mock-mcp.sh");
        fs::write(
            &path,
            r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([0-9]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo_tool","description":"echo","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}],"isError":false}}\n' "$id"
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

    #[tokio::test]
    async fn handshake_list_and_call_against_a_real_child() {
        let temp = tempfile::tempdir().unwrap();
        let script = write_script(temp.path());

        let mut child = tokio::process::Command::new("sh")
            .arg(&script)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let client = StdioClient::spawn("mock", stdout, stdin);

        let cancel = CancellationToken::new();
        let init = client
            .initialize(
                cancel.clone(),
                ClientInfo {
                    name: "fleet-test".to_string(),
                    version: "0.0.0".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(init.server_info.name, "mock");

        let tools = client.list_tools(cancel.clone()).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo_tool");

        let outcome = client
            .call_tool(cancel, "echo_tool", json!({"value": "ping"}))
            .await
            .unwrap();
        assert!(!outcome.is_error);
        assert_eq!(outcome.content[0]["text"], "pong");

        client.close().await;
        let _ = child.kill().await;
    }
}
