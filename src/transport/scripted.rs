// Deterministic in-memory transport used by tests

//! Scripted transport connector.
//!
//! Lets a test decide, per server id, whether opening a session succeeds and
//! what each invocation returns: a fixed response, a queue of one-shot
//! outcomes consumed in order, or a hard failure. Every invocation is
//! recorded so tests can assert on exactly what was sent where.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use super::{TransportClient, TransportConnector};
use crate::models::{ServerDefinition, Transport};
use crate::{MeshError, Result};

/// One scripted invocation result
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Success(Value),
    /// Fails the invocation with a connection-class error message
    Failure(String),
}

#[derive(Default)]
struct ScriptedState {
    /// One-shot outcomes per server, consumed front to back
    queues: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    /// Standing outcome once a server's queue is empty
    defaults: Mutex<HashMap<String, ScriptedOutcome>>,
    /// Servers whose sessions refuse to open at all
    refuse_open: Mutex<HashSet<String>>,
    /// (server id, transport) pairs that refuse to open
    refuse_transports: Mutex<HashSet<(String, Transport)>>,
    /// Every invocation seen: (server_id, operation)
    invocations: Mutex<Vec<(String, String)>>,
}

/// Test connector with per-server scripted behavior
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<ScriptedState>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        ScriptedConnector::default()
    }

    /// Every invocation on `server_id` succeeds with `value`
    pub fn always_succeed<S: Into<String>>(&self, server_id: S, value: Value) {
        self.state
            .defaults
            .lock()
            .unwrap()
            .insert(server_id.into(), ScriptedOutcome::Success(value));
    }

    /// Every invocation on `server_id` fails with a connection-class error
    pub fn always_fail<S: Into<String>, R: Into<String>>(&self, server_id: S, reason: R) {
        self.state
            .defaults
            .lock()
            .unwrap()
            .insert(server_id.into(), ScriptedOutcome::Failure(reason.into()));
    }

    /// Queue a one-shot outcome, consumed before the standing default
    pub fn enqueue<S: Into<String>>(&self, server_id: S, outcome: ScriptedOutcome) {
        self.state
            .queues
            .lock()
            .unwrap()
            .entry(server_id.into())
            .or_default()
            .push_back(outcome);
    }

    /// Make session establishment itself fail for `server_id`
    pub fn refuse_connection<S: Into<String>>(&self, server_id: S) {
        self.state
            .refuse_open
            .lock()
            .unwrap()
            .insert(server_id.into());
    }

    /// Refuse session establishment only over one transport
    pub fn refuse_transport<S: Into<String>>(&self, server_id: S, transport: Transport) {
        self.state
            .refuse_transports
            .lock()
            .unwrap()
            .insert((server_id.into(), transport));
    }

    /// All invocations recorded so far, in order
    pub fn invocations(&self) -> Vec<(String, String)> {
        self.state.invocations.lock().unwrap().clone()
    }

    /// Invocation count for one server
    pub fn invocation_count(&self, server_id: &str) -> usize {
        self.state
            .invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == server_id)
            .count()
    }

    fn next_outcome(&self, server_id: &str) -> ScriptedOutcome {
        if let Some(queue) = self.state.queues.lock().unwrap().get_mut(server_id) {
            if let Some(outcome) = queue.pop_front() {
                return outcome;
            }
        }
        self.state
            .defaults
            .lock()
            .unwrap()
            .get(server_id)
            .cloned()
            .unwrap_or_else(|| ScriptedOutcome::Success(json!({ "ok": true })))
    }
}

#[async_trait::async_trait]
impl TransportConnector for ScriptedConnector {
    async fn open(&self, definition: &ServerDefinition) -> Result<Box<dyn TransportClient>> {
        let refused = self
            .state
            .refuse_open
            .lock()
            .unwrap()
            .contains(&definition.id)
            || self
                .state
                .refuse_transports
                .lock()
                .unwrap()
                .contains(&(definition.id.clone(), definition.connection.transport()));
        if refused {
            return Err(MeshError::Connection {
                server_id: definition.id.clone(),
                reason: "connection refused by script".to_string(),
            });
        }
        Ok(Box::new(ScriptedClient {
            server_id: definition.id.clone(),
            connector: self.clone(),
        }))
    }
}

struct ScriptedClient {
    server_id: String,
    connector: ScriptedConnector,
}

#[async_trait::async_trait]
impl TransportClient for ScriptedClient {
    async fn invoke(&self, operation: &str, _params: &Value) -> Result<Value> {
        self.connector
            .state
            .invocations
            .lock()
            .unwrap()
            .push((self.server_id.clone(), operation.to_string()));

        match self.connector.next_outcome(&self.server_id) {
            ScriptedOutcome::Success(value) => Ok(value),
            ScriptedOutcome::Failure(reason) => Err(MeshError::Connection {
                server_id: self.server_id.clone(),
                reason,
            }),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServerDefinition;

    fn definition(id: &str) -> ServerDefinition {
        ServerDefinition::http(id, id, "http://localhost:1", 1000, vec!["op".to_string()])
    }

    #[tokio::test]
    async fn test_queue_precedes_default() {
        let connector = ScriptedConnector::new();
        connector.always_succeed("srv", json!("standing"));
        connector.enqueue("srv", ScriptedOutcome::Failure("one bad call".to_string()));

        let client = connector.open(&definition("srv")).await.unwrap();
        assert!(client.invoke("op", &Value::Null).await.is_err());
        let value = client.invoke("op", &Value::Null).await.unwrap();
        assert_eq!(value, json!("standing"));
        assert_eq!(connector.invocation_count("srv"), 2);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let connector = ScriptedConnector::new();
        connector.refuse_connection("srv");
        assert!(connector.open(&definition("srv")).await.is_err());
    }
}
