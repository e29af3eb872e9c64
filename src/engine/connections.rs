// Connection manager: per-transport session establishment and monitoring

//! # Connection Manager
//!
//! Owns at most one live connection per server id. Establishment goes
//! through the transport connector for the server's declared transport;
//! servers that opt into transport fallback get the remaining transports
//! tried in turn before the attempt is abandoned. Callers may pin a
//! transport/timeout contract on connect, and a mismatch is a fatal
//! configuration error rather than a connection failure.
//!
//! The periodic monitor sweep only updates bookkeeping: a connection whose
//! last ping is too old is marked disconnected, nothing in-flight is
//! aborted, and recovery stays reactive through the orchestrator.
//!
//! Lock order: registry locks are always taken (and released) before this
//! manager's connection map; no registry call is made while the map is held.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::events::EventBus;
use super::registry::ServerRegistry;
use crate::models::{
    Connection, ConnectionParams, ConnectionStatus, ServerDefinition, ServerStatus, Transport,
};
use crate::transport::{TransportClient, TransportConnector};
use crate::{MeshError, Result};

/// A caller-enforced connection contract: the server must use exactly this
/// transport and timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportExpectation {
    pub transport: Transport,
    pub timeout_ms: u64,
}

struct ActiveConnection {
    record: Connection,
    client: Arc<dyn TransportClient>,
}

/// Establishes, tracks, and monitors connections to registered servers
pub struct ConnectionManager {
    registry: Arc<ServerRegistry>,
    connector: Arc<dyn TransportConnector>,
    connections: RwLock<HashMap<String, ActiveConnection>>,
    stale_threshold_secs: i64,
    events: EventBus,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<ServerRegistry>,
        connector: Arc<dyn TransportConnector>,
        stale_threshold_secs: i64,
        events: EventBus,
    ) -> Self {
        ConnectionManager {
            registry,
            connector,
            connections: RwLock::new(HashMap::new()),
            stale_threshold_secs,
            events,
        }
    }

    /// Establish (or replace) the connection to `server_id`.
    ///
    /// When `expectation` is given, any transport or timeout deviation is a
    /// configuration error and no connection attempt is made.
    pub async fn connect(
        &self,
        server_id: &str,
        expectation: Option<TransportExpectation>,
    ) -> Result<Connection> {
        let definition = self.registry.get_server(server_id).await?;

        if let Some(expected) = expectation {
            if definition.transport != expected.transport {
                return Err(MeshError::Configuration(format!(
                    "server '{server_id}' must use transport {} but declares {}",
                    expected.transport, definition.transport
                )));
            }
            let declared_timeout = definition.connection.timeout_ms();
            if declared_timeout != expected.timeout_ms {
                return Err(MeshError::Configuration(format!(
                    "server '{server_id}' must use a {}ms timeout but declares {}ms",
                    expected.timeout_ms, declared_timeout
                )));
            }
        }

        match self.open_with_fallback(&definition).await {
            Ok((record, client)) => {
                let connection = record.clone();
                {
                    let mut connections = self.connections.write().await;
                    connections.insert(server_id.to_string(), ActiveConnection { record, client });
                }
                self.registry
                    .update_server_status(server_id, ServerStatus::Connected, None)
                    .await?;
                self.events
                    .emit_connection_established(server_id, connection.protocol);
                info!(server_id, protocol = %connection.protocol, "connected");
                Ok(connection)
            }
            Err(err) => {
                self.registry
                    .update_server_status(server_id, ServerStatus::Error, Some(err.to_string()))
                    .await?;
                Err(err)
            }
        }
    }

    /// Try the declared transport, then (for servers opting in) the other
    /// transports in turn
    async fn open_with_fallback(
        &self,
        definition: &ServerDefinition,
    ) -> Result<(Connection, Arc<dyn TransportClient>)> {
        let primary = self.open_one(definition, definition.transport).await;
        let first_error = match primary {
            Ok(opened) => return Ok(opened),
            Err(err) => err,
        };

        if !definition.metadata.transport_fallback {
            return Err(first_error);
        }

        warn!(
            server_id = %definition.id,
            transport = %definition.transport,
            error = %first_error,
            "declared transport failed, trying alternatives"
        );
        for alternative in definition.transport.alternatives() {
            match self.open_one(definition, alternative).await {
                Ok(opened) => {
                    info!(
                        server_id = %definition.id,
                        transport = %alternative,
                        "connected over fallback transport"
                    );
                    return Ok(opened);
                }
                Err(err) => {
                    debug!(
                        server_id = %definition.id,
                        transport = %alternative,
                        error = %err,
                        "fallback transport failed"
                    );
                }
            }
        }

        Err(first_error)
    }

    async fn open_one(
        &self,
        definition: &ServerDefinition,
        transport: Transport,
    ) -> Result<(Connection, Arc<dyn TransportClient>)> {
        let attempt = definition_for_transport(definition, transport);
        let client: Arc<dyn TransportClient> = Arc::from(self.connector.open(&attempt).await?);
        let record = Connection::new(
            definition.id.clone(),
            transport,
            attempt.connection.endpoint(),
        );
        Ok((record, client))
    }

    /// The connection currently tracked for `server_id`, connected or not
    pub async fn connection(&self, server_id: &str) -> Option<Connection> {
        let connections = self.connections.read().await;
        connections.get(server_id).map(|c| c.record.clone())
    }

    /// Every tracked connection, ordered by server id
    pub async fn active_connections(&self) -> Vec<Connection> {
        let connections = self.connections.read().await;
        let mut all: Vec<Connection> = connections.values().map(|c| c.record.clone()).collect();
        all.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        all
    }

    /// Drop the connection for `server_id`, if any
    pub async fn disconnect(&self, server_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        connections.remove(server_id).is_some()
    }

    /// Periodic sweep: mark connections with stale pings as disconnected.
    ///
    /// Pure bookkeeping. Never fails, never touches in-flight work, and is
    /// a no-op when nothing is connected.
    pub async fn monitor_connections(&self) {
        let stale_ids: Vec<String> = {
            let mut connections = self.connections.write().await;
            let mut flagged = Vec::new();
            for (server_id, active) in connections.iter_mut() {
                if active.record.status == ConnectionStatus::Connected
                    && active.record.is_stale(self.stale_threshold_secs)
                {
                    active.record.status = ConnectionStatus::Disconnected;
                    flagged.push(server_id.clone());
                }
            }
            flagged
        };

        for server_id in stale_ids {
            warn!(server_id, "connection went stale");
            self.events.emit_connection_lost(&server_id);
        }
    }

    /// React to a detected disconnection: mark the record and record the
    /// event. Reconnection is the caller's decision, typically through the
    /// orchestrator's resilience path.
    pub async fn handle_disconnection(&self, server_id: &str) {
        let marked = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(server_id) {
                Some(active) if active.record.status == ConnectionStatus::Connected => {
                    active.record.status = ConnectionStatus::Disconnected;
                    true
                }
                _ => false,
            }
        };

        if marked {
            warn!(server_id, "disconnection recorded");
            self.events.emit_connection_lost(server_id);
        }
        // Status change is best-effort; the server may already be gone
        let _ = self
            .registry
            .update_server_status(server_id, ServerStatus::Unknown, None)
            .await;
    }

    /// Registered servers sharing at least one capability with `server_id`,
    /// ordered by routing priority, for re-routing after a failure
    pub async fn provide_fallback_options(&self, server_id: &str) -> Result<Vec<ServerDefinition>> {
        let failed = self.registry.get_server(server_id).await?;
        let mut options: Vec<ServerDefinition> = self
            .registry
            .get_registered_servers()
            .await
            .into_iter()
            .filter(|candidate| {
                candidate.id != server_id && !candidate.shared_capabilities(&failed).is_empty()
            })
            .collect();
        options.sort_by(|a, b| {
            b.metadata
                .source
                .priority()
                .cmp(&a.metadata.source.priority())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(options)
    }

    /// Send one operation over the (re-established if needed) connection
    pub async fn invoke(&self, server_id: &str, operation: &str, params: &Value) -> Result<Value> {
        let client = self.ensure_connected(server_id).await?;
        let result = client.invoke(operation, params).await;

        if result.is_ok() {
            let mut connections = self.connections.write().await;
            if let Some(active) = connections.get_mut(server_id) {
                active.record.touch();
            }
        }
        result
    }

    async fn ensure_connected(&self, server_id: &str) -> Result<Arc<dyn TransportClient>> {
        {
            let connections = self.connections.read().await;
            if let Some(active) = connections.get(server_id) {
                if active.record.status == ConnectionStatus::Connected {
                    return Ok(Arc::clone(&active.client));
                }
            }
        }

        self.connect(server_id, None).await?;
        let connections = self.connections.read().await;
        connections
            .get(server_id)
            .map(|active| Arc::clone(&active.client))
            .ok_or_else(|| MeshError::Connection {
                server_id: server_id.to_string(),
                reason: "connection vanished after establishment".to_string(),
            })
    }

    #[cfg(test)]
    pub(crate) async fn age_connection(&self, server_id: &str, secs: i64) {
        let mut connections = self.connections.write().await;
        if let Some(active) = connections.get_mut(server_id) {
            active.record.last_ping = chrono::Utc::now() - chrono::Duration::seconds(secs);
        }
    }
}

/// Connection parameters for trying `transport` against a server that
/// declared a different one. Network endpoints get their scheme rewritten;
/// a stdio fallback reuses the endpoint as a command path.
fn definition_for_transport(definition: &ServerDefinition, transport: Transport) -> ServerDefinition {
    if transport == definition.transport {
        return definition.clone();
    }

    let timeout_ms = definition.connection.timeout_ms();
    let endpoint = definition.connection.endpoint().to_string();
    let connection = match transport {
        Transport::Stdio => ConnectionParams::Stdio {
            command: endpoint,
            args: Vec::new(),
            timeout_ms,
        },
        Transport::Http => ConnectionParams::Http {
            url: rewrite_scheme(&endpoint, "http", "https"),
            timeout_ms,
        },
        Transport::WebSocket => ConnectionParams::WebSocket {
            url: rewrite_scheme(&endpoint, "ws", "wss"),
            timeout_ms,
        },
    };

    let mut attempt = definition.clone();
    attempt.transport = transport;
    attempt.connection = connection;
    attempt
}

fn rewrite_scheme(endpoint: &str, plain: &str, secure: &str) -> String {
    match url::Url::parse(endpoint) {
        Ok(parsed) => {
            let target = match parsed.scheme() {
                "https" | "wss" => secure,
                _ => plain,
            };
            let rest = endpoint.splitn(2, "://").nth(1).unwrap_or(endpoint);
            format!("{target}://{rest}")
        }
        Err(_) => format!("{plain}://{endpoint}"),
    }
}
