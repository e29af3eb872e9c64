// Stdio transport: local executables spoken to over stdin/stdout

use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::debug;

use super::{TransportClient, WireRequest, WireResponse};
use crate::{MeshError, Result};

/// Session with a spawned local tool server.
///
/// Requests are newline-delimited JSON envelopes on the child's stdin;
/// responses come back one JSON line each on its stdout. The configured
/// timeout bounds the handshake and every individual exchange.
pub struct StdioClient {
    server_id: String,
    timeout: Duration,
    io: Mutex<ChildIo>,
    // Held so the process dies with the client
    _child: Child,
}

struct ChildIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl StdioClient {
    /// Spawn the executable and complete the line-protocol handshake
    pub async fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        timeout_ms: u64,
    ) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MeshError::Connection {
                server_id: server_id.to_string(),
                reason: format!("failed to spawn '{command}': {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| MeshError::Connection {
            server_id: server_id.to_string(),
            reason: "child stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| MeshError::Connection {
            server_id: server_id.to_string(),
            reason: "child stdout unavailable".to_string(),
        })?;

        let client = StdioClient {
            server_id: server_id.to_string(),
            timeout: Duration::from_millis(timeout_ms),
            io: Mutex::new(ChildIo {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            _child: child,
        };

        client.exchange("handshake", &Value::Null).await?;
        debug!(server_id, command, "stdio session established");
        Ok(client)
    }

    async fn exchange(&self, operation: &str, params: &Value) -> Result<Value> {
        let request = WireRequest::new(operation, params.clone());
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let mut io = self.io.lock().await;
        let round_trip = async {
            io.stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| self.transport_err(format!("write failed: {e}")))?;
            io.stdin
                .flush()
                .await
                .map_err(|e| self.transport_err(format!("flush failed: {e}")))?;

            let mut response_line = String::new();
            let read = io
                .stdout
                .read_line(&mut response_line)
                .await
                .map_err(|e| self.transport_err(format!("read failed: {e}")))?;
            if read == 0 {
                return Err(self.transport_err("server closed stdout".to_string()));
            }
            Ok(response_line)
        };

        let response_line = tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| MeshError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })??;

        let response: WireResponse = serde_json::from_str(response_line.trim())?;
        match response.error {
            Some(error) => Err(self.transport_err(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    fn transport_err(&self, reason: String) -> MeshError {
        MeshError::Transport(format!("stdio server '{}': {reason}", self.server_id))
    }
}

#[async_trait::async_trait]
impl TransportClient for StdioClient {
    async fn invoke(&self, operation: &str, params: &Value) -> Result<Value> {
        self.exchange(operation, params).await
    }

    async fn ping(&self) -> Result<()> {
        self.exchange("ping", &Value::Null).await.map(|_| ())
    }
}
