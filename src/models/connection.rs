// Live connection records owned by the connection manager

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::server::Transport;

/// Status of one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// A live binding to a registered server.
///
/// At most one active connection exists per server id; the connection
/// manager replaces the record on reconnect or protocol fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub server_id: String,
    pub protocol: Transport,
    pub endpoint: String,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
}

impl Connection {
    pub fn new<S: Into<String>, E: Into<String>>(
        server_id: S,
        protocol: Transport,
        endpoint: E,
    ) -> Self {
        let now = Utc::now();
        Connection {
            server_id: server_id.into(),
            protocol,
            endpoint: endpoint.into(),
            status: ConnectionStatus::Connected,
            connected_at: now,
            last_ping: now,
        }
    }

    /// Record successful traffic on this connection
    pub fn touch(&mut self) {
        self.last_ping = Utc::now();
    }

    /// True when the last ping is older than the staleness threshold
    pub fn is_stale(&self, threshold_secs: i64) -> bool {
        Utc::now() - self.last_ping > Duration::seconds(threshold_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_connection_is_connected() {
        let conn = Connection::new("srv", Transport::Http, "http://localhost:8080");
        assert_eq!(conn.status, ConnectionStatus::Connected);
        assert!(!conn.is_stale(60));
    }

    #[test]
    fn test_staleness_detection() {
        let mut conn = Connection::new("srv", Transport::Stdio, "/usr/bin/tool");
        conn.last_ping = Utc::now() - Duration::seconds(120);
        assert!(conn.is_stale(60));
        conn.touch();
        assert!(!conn.is_stale(60));
    }
}
