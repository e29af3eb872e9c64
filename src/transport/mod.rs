// Transport connectors: how the mesh actually reaches a tool server

//! # Transport Layer
//!
//! The core depends on an abstract "open a session, send an operation, get a
//! result or error" capability. [`TransportConnector`] opens a
//! protocol-specific session for a server definition; the resulting
//! [`TransportClient`] carries individual operations and answers pings.
//!
//! [`NetworkConnector`] is the production implementation, dispatching on the
//! definition's transport: process spawn for stdio servers, `reqwest` for
//! HTTP, `tokio-tungstenite` for WebSocket. [`ScriptedConnector`] is the
//! deterministic in-memory implementation the tests use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ConnectionParams, ServerDefinition};
use crate::Result;

pub mod http;
pub mod scripted;
pub mod stdio;
pub mod ws;

pub use scripted::{ScriptedConnector, ScriptedOutcome};

/// One request on the wire. Every transport speaks the same JSON envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: Uuid,
    pub operation: String,
    pub params: Value,
}

impl WireRequest {
    pub fn new<O: Into<String>>(operation: O, params: Value) -> Self {
        WireRequest {
            id: Uuid::new_v4(),
            operation: operation.into(),
            params,
        }
    }
}

/// One response off the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: Uuid,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// A live protocol session to one server
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Send one operation and wait for its result
    async fn invoke(&self, operation: &str, params: &Value) -> Result<Value>;

    /// Cheap liveness probe
    async fn ping(&self) -> Result<()>;
}

/// Opens protocol sessions for server definitions
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self, definition: &ServerDefinition) -> Result<Box<dyn TransportClient>>;
}

/// Production connector: dispatches on the definition's transport
#[derive(Debug, Default, Clone)]
pub struct NetworkConnector;

impl NetworkConnector {
    pub fn new() -> Self {
        NetworkConnector
    }
}

#[async_trait]
impl TransportConnector for NetworkConnector {
    async fn open(&self, definition: &ServerDefinition) -> Result<Box<dyn TransportClient>> {
        match &definition.connection {
            ConnectionParams::Stdio {
                command,
                args,
                timeout_ms,
            } => {
                let client =
                    stdio::StdioClient::spawn(&definition.id, command, args, *timeout_ms).await?;
                Ok(Box::new(client))
            }
            ConnectionParams::Http { url, timeout_ms } => {
                let client = http::HttpClient::connect(&definition.id, url, *timeout_ms).await?;
                Ok(Box::new(client))
            }
            ConnectionParams::WebSocket { url, timeout_ms } => {
                let client = ws::WsClient::connect(&definition.id, url, *timeout_ms).await?;
                Ok(Box::new(client))
            }
        }
    }
}
