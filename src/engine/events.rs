// Event system connecting the engines to external observers

//! # Event System
//!
//! Broadcast bus for the structured events the core emits while it works:
//! retries, circuit transitions, checkpoints, fallbacks, connection and
//! registry changes. The core only publishes; how events are stored or
//! displayed is the subscriber's business. Publishing never blocks and
//! never fails, a bus with no subscribers just drops events.

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::models::{CircuitState, ExecutionStatus, MeshEvent, Transport};

/// Broadcast bus for [`MeshEvent`]s
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MeshEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: MeshEvent) {
        trace!(?event, "mesh event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as an async stream
    pub fn stream(&self) -> BroadcastStream<MeshEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn emit_server_registered(&self, server_id: &str, capabilities: &[String]) {
        self.publish(MeshEvent::ServerRegistered {
            server_id: server_id.to_string(),
            capabilities: capabilities.to_vec(),
            timestamp: Utc::now(),
        });
    }

    pub fn emit_server_unregistered(&self, server_id: &str) {
        self.publish(MeshEvent::ServerUnregistered {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn emit_discovery_completed(&self, servers: usize) {
        self.publish(MeshEvent::DiscoveryCompleted {
            servers,
            timestamp: Utc::now(),
        });
    }

    pub fn emit_connection_established(&self, server_id: &str, protocol: Transport) {
        self.publish(MeshEvent::ConnectionEstablished {
            server_id: server_id.to_string(),
            protocol,
            timestamp: Utc::now(),
        });
    }

    pub fn emit_connection_lost(&self, server_id: &str) {
        self.publish(MeshEvent::ConnectionLost {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn emit_retry_attempted(&self, operation: &str, attempt: u32, delay_ms: u64) {
        self.publish(MeshEvent::RetryAttempted {
            operation: operation.to_string(),
            attempt,
            delay_ms,
            timestamp: Utc::now(),
        });
    }

    pub fn emit_circuit_state_changed(&self, server_id: &str, from: CircuitState, to: CircuitState) {
        self.publish(MeshEvent::CircuitStateChanged {
            server_id: server_id.to_string(),
            from,
            to,
            timestamp: Utc::now(),
        });
    }

    pub fn emit_checkpoint_created(&self, workflow_id: &str, step_index: usize) {
        self.publish(MeshEvent::CheckpointCreated {
            workflow_id: workflow_id.to_string(),
            step_index,
            timestamp: Utc::now(),
        });
    }

    pub fn emit_fallback_used(&self, operation: &str, source_id: &str) {
        self.publish(MeshEvent::FallbackUsed {
            operation: operation.to_string(),
            source_id: source_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn emit_workflow_started(&self, execution_id: &str, definition_id: &str) {
        self.publish(MeshEvent::WorkflowStarted {
            execution_id: execution_id.to_string(),
            definition_id: definition_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn emit_workflow_finished(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        completed_steps: usize,
        failed_steps: usize,
    ) {
        self.publish(MeshEvent::WorkflowFinished {
            execution_id: execution_id.to_string(),
            status,
            completed_steps,
            failed_steps,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit_checkpoint_created("wf", 2);

        match rx.recv().await.unwrap() {
            MeshEvent::CheckpointCreated {
                workflow_id,
                step_index,
                ..
            } => {
                assert_eq!(workflow_id, "wf");
                assert_eq!(step_index, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit_connection_lost("srv");
    }
}
