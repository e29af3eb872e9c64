// Observability events published on the mesh event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::breaker::CircuitState;
use super::server::Transport;
use super::workflow::ExecutionStatus;

/// Structured events the core emits as it works.
///
/// Consumers subscribe through the event bus; the core does not depend on
/// how events are stored or displayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeshEvent {
    ServerRegistered {
        server_id: String,
        capabilities: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    ServerUnregistered {
        server_id: String,
        timestamp: DateTime<Utc>,
    },
    DiscoveryCompleted {
        servers: usize,
        timestamp: DateTime<Utc>,
    },
    ConnectionEstablished {
        server_id: String,
        protocol: Transport,
        timestamp: DateTime<Utc>,
    },
    ConnectionLost {
        server_id: String,
        timestamp: DateTime<Utc>,
    },
    RetryAttempted {
        operation: String,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    CircuitStateChanged {
        server_id: String,
        from: CircuitState,
        to: CircuitState,
        timestamp: DateTime<Utc>,
    },
    CheckpointCreated {
        workflow_id: String,
        step_index: usize,
        timestamp: DateTime<Utc>,
    },
    FallbackUsed {
        operation: String,
        source_id: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowStarted {
        execution_id: String,
        definition_id: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowFinished {
        execution_id: String,
        status: ExecutionStatus,
        completed_steps: usize,
        failed_steps: usize,
        timestamp: DateTime<Utc>,
    },
}
