// HTTP transport: request/response against a tool server endpoint

use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{TransportClient, WireRequest, WireResponse};
use crate::{MeshError, Result};

/// Session with an HTTP tool server. Connection establishment is a
/// reachability probe; each operation is one JSON POST.
pub struct HttpClient {
    server_id: String,
    url: String,
    timeout_ms: u64,
    client: reqwest::Client,
}

impl HttpClient {
    pub async fn connect(server_id: &str, url: &str, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| MeshError::Connection {
                server_id: server_id.to_string(),
                reason: format!("http client build failed: {e}"),
            })?;

        // Reachability probe; any response proves the endpoint is there
        client
            .get(url)
            .send()
            .await
            .map_err(|e| MeshError::Connection {
                server_id: server_id.to_string(),
                reason: format!("unreachable at {url}: {e}"),
            })?;

        debug!(server_id, url, "http session established");
        Ok(HttpClient {
            server_id: server_id.to_string(),
            url: url.to_string(),
            timeout_ms,
            client,
        })
    }

    fn transport_err(&self, reason: String) -> MeshError {
        MeshError::Transport(format!("http server '{}': {reason}", self.server_id))
    }
}

#[async_trait::async_trait]
impl TransportClient for HttpClient {
    async fn invoke(&self, operation: &str, params: &Value) -> Result<Value> {
        let request = WireRequest::new(operation, params.clone());
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MeshError::Timeout {
                        timeout_ms: self.timeout_ms,
                    }
                } else {
                    self.transport_err(format!("request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(self.transport_err(format!("status {}", response.status())));
        }

        let envelope: WireResponse = response
            .json()
            .await
            .map_err(|e| self.transport_err(format!("invalid response body: {e}")))?;

        match envelope.error {
            Some(error) => Err(self.transport_err(error)),
            None => Ok(envelope.result.unwrap_or(Value::Null)),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .get(&self.url)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| self.transport_err(format!("ping failed: {e}")))
    }
}
