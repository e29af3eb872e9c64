// Tool server definitions - registered remote peers and their capabilities

//! # Server Definitions
//!
//! A `ServerDefinition` describes one remote tool server: how to reach it
//! (transport plus connection parameters), what it can do (its capability
//! set), and where it came from (discovery metadata). Definitions are created
//! by discovery or explicit registration, mutated only through status
//! updates, and removed by explicit unregistration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Communication mechanism used to reach a server.
///
/// The set of supported transports is closed. Anything a caller could feed
/// in that is not one of these three values fails at deserialization time,
/// so downstream code never sees an unsupported protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Local executable spoken to over stdin/stdout
    Stdio,
    /// HTTP service
    Http,
    /// WebSocket service
    #[serde(rename = "websocket")]
    WebSocket,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Stdio => "stdio",
            Transport::Http => "http",
            Transport::WebSocket => "websocket",
        }
    }

    /// The other two transports, in the order a connection fallback tries them
    pub fn alternatives(&self) -> [Transport; 2] {
        match self {
            Transport::Stdio => [Transport::Http, Transport::WebSocket],
            Transport::Http => [Transport::WebSocket, Transport::Stdio],
            Transport::WebSocket => [Transport::Http, Transport::Stdio],
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport-specific connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ConnectionParams {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        timeout_ms: u64,
    },
    Http {
        url: String,
        timeout_ms: u64,
    },
    #[serde(rename = "websocket")]
    WebSocket {
        url: String,
        timeout_ms: u64,
    },
}

impl ConnectionParams {
    /// The transport these parameters belong to
    pub fn transport(&self) -> Transport {
        match self {
            ConnectionParams::Stdio { .. } => Transport::Stdio,
            ConnectionParams::Http { .. } => Transport::Http,
            ConnectionParams::WebSocket { .. } => Transport::WebSocket,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        match self {
            ConnectionParams::Stdio { timeout_ms, .. }
            | ConnectionParams::Http { timeout_ms, .. }
            | ConnectionParams::WebSocket { timeout_ms, .. } => *timeout_ms,
        }
    }

    /// Human-readable endpoint: the command for stdio, the URL otherwise
    pub fn endpoint(&self) -> &str {
        match self {
            ConnectionParams::Stdio { command, .. } => command,
            ConnectionParams::Http { url, .. } | ConnectionParams::WebSocket { url, .. } => url,
        }
    }
}

/// Registry-level server status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Available,
    Connected,
    Error,
    Unknown,
}

impl ServerStatus {
    /// Whether the router may hand this server out as a candidate
    pub fn is_selectable(&self) -> bool {
        matches!(self, ServerStatus::Available | ServerStatus::Connected)
    }
}

/// Where a server definition came from. Determines routing priority:
/// built-in servers outrank first-party ones, which outrank community and
/// external servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerSource {
    BuiltIn,
    FirstParty,
    Community,
    External,
}

impl ServerSource {
    /// Monotonic preference score used by the capability router
    pub fn priority(&self) -> u32 {
        match self {
            ServerSource::BuiltIn => 100,
            ServerSource::FirstParty => 75,
            ServerSource::Community => 50,
            ServerSource::External => 25,
        }
    }
}

impl Default for ServerSource {
    fn default() -> Self {
        ServerSource::External
    }
}

/// Policy for picking among multiple servers offering the same capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Highest-priority available server wins
    First,
    /// The flagged-preferred server wins if available, otherwise `First`
    Preferred,
    /// Rotate among available servers
    RoundRobin,
}

/// Discovery and routing metadata attached to a server definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMetadata {
    /// Which discovery tier produced this definition
    #[serde(default)]
    pub source: ServerSource,
    pub version: Option<String>,
    /// Explicit conflict-resolution strategy for this server's capabilities.
    /// When absent the router infers one per capability.
    pub conflict_strategy: Option<ConflictStrategy>,
    /// Marks this server as the preferred provider of its capabilities
    #[serde(default)]
    pub preferred: bool,
    /// Opt-in: on connection failure, try the remaining transports in turn
    #[serde(default)]
    pub transport_fallback: bool,
}

/// A registered remote tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDefinition {
    /// Unique identifier within a registry instance
    pub id: String,
    pub name: String,
    pub transport: Transport,
    pub connection: ConnectionParams,
    /// Named operations this server claims to support. Never empty.
    pub capabilities: Vec<String>,
    pub status: ServerStatus,
    #[serde(default)]
    pub metadata: ServerMetadata,
}

impl ServerDefinition {
    /// Definition for a local executable reached over stdio
    pub fn stdio<S: Into<String>, N: Into<String>, C: Into<String>>(
        id: S,
        name: N,
        command: C,
        args: Vec<String>,
        timeout_ms: u64,
        capabilities: Vec<String>,
    ) -> Self {
        ServerDefinition {
            id: id.into(),
            name: name.into(),
            transport: Transport::Stdio,
            connection: ConnectionParams::Stdio {
                command: command.into(),
                args,
                timeout_ms,
            },
            capabilities,
            status: ServerStatus::Available,
            metadata: ServerMetadata::default(),
        }
    }

    /// Definition for an HTTP service
    pub fn http<S: Into<String>, N: Into<String>, U: Into<String>>(
        id: S,
        name: N,
        url: U,
        timeout_ms: u64,
        capabilities: Vec<String>,
    ) -> Self {
        ServerDefinition {
            id: id.into(),
            name: name.into(),
            transport: Transport::Http,
            connection: ConnectionParams::Http {
                url: url.into(),
                timeout_ms,
            },
            capabilities,
            status: ServerStatus::Available,
            metadata: ServerMetadata::default(),
        }
    }

    /// Definition for a WebSocket service
    pub fn websocket<S: Into<String>, N: Into<String>, U: Into<String>>(
        id: S,
        name: N,
        url: U,
        timeout_ms: u64,
        capabilities: Vec<String>,
    ) -> Self {
        ServerDefinition {
            id: id.into(),
            name: name.into(),
            transport: Transport::WebSocket,
            connection: ConnectionParams::WebSocket {
                url: url.into(),
                timeout_ms,
            },
            capabilities,
            status: ServerStatus::Available,
            metadata: ServerMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: ServerMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check that the definition is well-formed: id and name present,
    /// capability set non-empty, connection parameters matching the declared
    /// transport.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("server id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err(format!("server '{}' has an empty name", self.id));
        }
        if self.capabilities.is_empty() {
            return Err(format!("server '{}' declares no capabilities", self.id));
        }
        if self.connection.transport() != self.transport {
            return Err(format!(
                "server '{}' declares transport {} but carries {} connection parameters",
                self.id,
                self.transport,
                self.connection.transport()
            ));
        }
        Ok(())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Capabilities this server shares with another
    pub fn shared_capabilities(&self, other: &ServerDefinition) -> Vec<String> {
        self.capabilities
            .iter()
            .filter(|c| other.has_capability(c))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerDefinition {
        ServerDefinition::stdio(
            "files",
            "File Tools",
            "/usr/local/bin/file-tools",
            vec!["--serve".to_string()],
            15000,
            vec!["read_file".to_string(), "write_file".to_string()],
        )
    }

    #[test]
    fn test_validate_accepts_well_formed_definition() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_capabilities() {
        let mut def = sample();
        def.capabilities.clear();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_transport_mismatch() {
        let mut def = sample();
        def.transport = Transport::Http;
        let err = def.validate().unwrap_err();
        assert!(err.contains("transport"));
    }

    #[test]
    fn test_validate_rejects_blank_id() {
        let mut def = sample();
        def.id = "  ".to_string();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_transport_serde_round_trip() {
        let json = serde_json::to_string(&Transport::WebSocket).unwrap();
        assert_eq!(json, "\"websocket\"");
        let back: Transport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Transport::WebSocket);

        // Unsupported values never become a Transport
        assert!(serde_json::from_str::<Transport>("\"grpc\"").is_err());
    }

    #[test]
    fn test_source_priority_ordering() {
        assert!(ServerSource::BuiltIn.priority() > ServerSource::FirstParty.priority());
        assert!(ServerSource::FirstParty.priority() > ServerSource::Community.priority());
        assert!(ServerSource::Community.priority() > ServerSource::External.priority());
    }

    #[test]
    fn test_shared_capabilities() {
        let a = sample();
        let b = ServerDefinition::http(
            "backup-files",
            "Backup File Tools",
            "http://localhost:9000",
            5000,
            vec!["read_file".to_string(), "archive".to_string()],
        );
        assert_eq!(a.shared_capabilities(&b), vec!["read_file".to_string()]);
    }
}
