// WebSocket transport: persistent duplex session with a tool server

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{TransportClient, WireRequest, WireResponse};
use crate::{MeshError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session over one upgraded WebSocket. Requests and responses are JSON
/// text frames, one in flight at a time per session.
pub struct WsClient {
    server_id: String,
    timeout: Duration,
    stream: Mutex<WsStream>,
}

impl WsClient {
    /// Perform the upgrade handshake under the configured timeout
    pub async fn connect(server_id: &str, url: &str, timeout_ms: u64) -> Result<Self> {
        let timeout = Duration::from_millis(timeout_ms);
        let (stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| MeshError::Timeout { timeout_ms })?
            .map_err(|e| MeshError::Connection {
                server_id: server_id.to_string(),
                reason: format!("websocket upgrade failed for {url}: {e}"),
            })?;

        debug!(server_id, url, "websocket session established");
        Ok(WsClient {
            server_id: server_id.to_string(),
            timeout,
            stream: Mutex::new(stream),
        })
    }

    fn transport_err(&self, reason: String) -> MeshError {
        MeshError::Transport(format!("websocket server '{}': {reason}", self.server_id))
    }

    async fn exchange(&self, operation: &str, params: &Value) -> Result<Value> {
        let request = WireRequest::new(operation, params.clone());
        let payload = serde_json::to_string(&request)?;

        let mut stream = self.stream.lock().await;
        let round_trip = async {
            stream
                .send(Message::Text(payload))
                .await
                .map_err(|e| self.transport_err(format!("send failed: {e}")))?;

            // Skip control frames until a text response arrives
            while let Some(frame) = stream.next().await {
                let frame = frame.map_err(|e| self.transport_err(format!("receive failed: {e}")))?;
                match frame {
                    Message::Text(text) => return Ok(text),
                    Message::Close(_) => {
                        return Err(self.transport_err("server closed the session".to_string()))
                    }
                    _ => continue,
                }
            }
            Err(self.transport_err("stream ended without a response".to_string()))
        };

        let text = tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| MeshError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })??;

        let response: WireResponse = serde_json::from_str(&text)?;
        match response.error {
            Some(error) => Err(self.transport_err(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }
}

#[async_trait::async_trait]
impl TransportClient for WsClient {
    async fn invoke(&self, operation: &str, params: &Value) -> Result<Value> {
        self.exchange(operation, params).await
    }

    async fn ping(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        tokio::time::timeout(self.timeout, stream.send(Message::Ping(Vec::new())))
            .await
            .map_err(|_| MeshError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|e| self.transport_err(format!("ping failed: {e}")))
    }
}
