// Composition root wiring the engines together

//! # Composition Root
//!
//! [`ToolMesh`] builds the whole engine stack from a [`MeshConfig`] and the
//! injected collaborators: discovery sources, a transport connector, a
//! storage backend, and a policy gate. There is no process-global state;
//! anything that wants a mesh constructs one, and tests reset runtime state
//! through [`ToolMesh::reset_for_tests`] instead of poking module globals.

use std::sync::Arc;

use crate::config::MeshConfig;
use crate::engine::connections::ConnectionManager;
use crate::engine::events::EventBus;
use crate::engine::orchestrator::{OrchestratorParts, WorkflowOrchestrator};
use crate::engine::registry::{DiscoverySource, ServerRegistry};
use crate::engine::router::CapabilityRouter;
use crate::engine::storage::{InMemoryStorage, MeshStorage};
use crate::models::ServerDefinition;
use crate::policy::{AllowAllPolicy, PolicyGate};
use crate::resilience::{CheckpointManager, CircuitBreakerRegistry};
use crate::transport::{NetworkConnector, TransportConnector};

/// External collaborators the mesh is wired from
pub struct MeshDeps {
    pub sources: Vec<Arc<dyn DiscoverySource>>,
    pub connector: Arc<dyn TransportConnector>,
    pub storage: Arc<dyn MeshStorage>,
    pub policy: Arc<dyn PolicyGate>,
}

impl Default for MeshDeps {
    fn default() -> Self {
        MeshDeps {
            sources: Vec::new(),
            connector: Arc::new(NetworkConnector::new()),
            storage: Arc::new(InMemoryStorage::new()),
            policy: Arc::new(AllowAllPolicy),
        }
    }
}

/// The assembled engine stack
pub struct ToolMesh {
    config: MeshConfig,
    events: EventBus,
    registry: Arc<ServerRegistry>,
    router: Arc<CapabilityRouter>,
    connections: Arc<ConnectionManager>,
    checkpoints: Arc<CheckpointManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    orchestrator: Arc<WorkflowOrchestrator>,
}

impl ToolMesh {
    /// Wire a mesh from explicit collaborators
    pub fn new(config: MeshConfig, deps: MeshDeps) -> Self {
        let events = EventBus::new();
        let registry = Arc::new(ServerRegistry::new(deps.sources, events.clone()));
        let router = Arc::new(CapabilityRouter::new(Arc::clone(&registry)));
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            deps.connector,
            config.stale_connection_secs,
            events.clone(),
        ));
        let checkpoints = Arc::new(CheckpointManager::with_events(
            config.max_checkpoints_per_workflow,
            events.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::with_events(
            config.breaker,
            events.clone(),
        ));
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            OrchestratorParts {
                registry: Arc::clone(&registry),
                router: Arc::clone(&router),
                connections: Arc::clone(&connections),
                checkpoints: Arc::clone(&checkpoints),
                breakers: Arc::clone(&breakers),
                storage: deps.storage,
                policy: deps.policy,
                events: events.clone(),
            },
            config.retry.clone(),
            config.fallback_timeout_ms,
        ));

        ToolMesh {
            config,
            events,
            registry,
            router,
            connections,
            checkpoints,
            breakers,
            orchestrator,
        }
    }

    /// Mesh with in-memory storage, the network connector, and a permissive
    /// policy gate
    pub fn in_memory(config: MeshConfig) -> Self {
        Self::new(config, MeshDeps::default())
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn router(&self) -> &CapabilityRouter {
        &self.router
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn orchestrator(&self) -> &WorkflowOrchestrator {
        &self.orchestrator
    }

    /// Discover servers and rebuild the capability mapping over the result
    pub async fn discover_and_route(&self) -> Vec<ServerDefinition> {
        let servers = self.registry.discover_servers().await;
        self.router.rebuild().await;
        servers
    }

    /// Clear runtime state: open connections and breaker history. Intended
    /// for test isolation at the composition root.
    pub async fn reset_for_tests(&self) {
        for connection in self.connections.active_connections().await {
            self.connections.disconnect(&connection.server_id).await;
        }
        self.breakers.reset_all();
        self.router.rebuild().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionStatus, MeshEvent, WorkflowDefinition, WorkflowStep};
    use crate::transport::ScriptedConnector;
    use serde_json::json;

    fn scripted_mesh(servers: Vec<ServerDefinition>) -> (ToolMesh, ScriptedConnector) {
        let connector = ScriptedConnector::new();
        let mesh = ToolMesh::new(
            MeshConfig::default(),
            MeshDeps {
                sources: vec![Arc::new(crate::engine::registry::StaticDiscovery::new(
                    "seed", servers,
                ))],
                connector: Arc::new(connector.clone()),
                storage: Arc::new(InMemoryStorage::new()),
                policy: Arc::new(AllowAllPolicy),
            },
        );
        (mesh, connector)
    }

    #[tokio::test]
    async fn test_end_to_end_discovery_routing_execution() {
        let (mesh, connector) = scripted_mesh(vec![ServerDefinition::http(
            "files",
            "File Tools",
            "http://localhost:9000/files",
            5000,
            vec!["read_file".to_string()],
        )]);
        connector.always_succeed("files", json!({"bytes": 7}));

        let discovered = mesh.discover_and_route().await;
        assert_eq!(discovered.len(), 1);

        let mut events = mesh.events().subscribe();
        let definition = WorkflowDefinition::new(
            "wf",
            "End to end",
            vec![WorkflowStep::remote_call("fetch", "read_file", "read_file")],
        );
        let execution = mesh
            .orchestrator()
            .execute_workflow(&definition)
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step_results["fetch"].output, Some(json!({"bytes": 7})));

        // The run produced observable events, workflow start first
        match events.recv().await.unwrap() {
            MeshEvent::WorkflowStarted { definition_id, .. } => {
                assert_eq!(definition_id, "wf");
            }
            other => panic!("unexpected first event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reset_clears_runtime_state() {
        let (mesh, connector) = scripted_mesh(vec![ServerDefinition::http(
            "files",
            "File Tools",
            "http://localhost:9000/files",
            5000,
            vec!["read_file".to_string()],
        )]);
        mesh.discover_and_route().await;
        connector.always_succeed("files", json!("ok"));

        mesh.connections().connect("files", None).await.unwrap();
        assert_eq!(mesh.connections().active_connections().await.len(), 1);

        mesh.reset_for_tests().await;
        assert!(mesh.connections().active_connections().await.is_empty());
    }
}
