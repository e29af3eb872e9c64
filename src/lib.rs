// Toolmesh - orchestration engine for heterogeneous tool servers
// Discovers servers, routes capabilities, and keeps workflows progressing
// through retries, circuit breakers, checkpoints, and fallback sourcing

//! # Toolmesh Library
//!
//! Toolmesh coordinates access to a fleet of remote tool servers: local
//! executables spoken to over stdio, HTTP services, and WebSocket services.
//! Each server exposes a named set of capabilities; clients submit
//! multi-step workflows whose steps invoke those capabilities.
//!
//! ## Core Components
//!
//! - [`ServerRegistry`]: discovery, registration, capability indexing
//! - [`CapabilityRouter`]: picks a server when several offer one capability
//! - [`ConnectionManager`]: per-transport connection establishment and
//!   staleness monitoring
//! - [`WorkflowOrchestrator`]: dependency-ordered step execution,
//!   multi-server fan-out, disconnection recovery
//! - Resilience layer: [`resilience::RetryRunner`],
//!   [`resilience::CircuitBreaker`], [`resilience::CheckpointManager`],
//!   [`resilience::FallbackHandler`]
//!
//! ## Composition
//!
//! Everything is wired explicitly through [`ToolMesh`], the composition
//! root. There are no process-wide singletons; tests build their own mesh
//! from a [`MeshConfig`] and reset it through the root.
//!
//! ```rust,no_run
//! use toolmesh::{MeshConfig, ToolMesh};
//!
//! # async fn run() -> toolmesh::Result<()> {
//! let mesh = ToolMesh::in_memory(MeshConfig::default());
//! let servers = mesh.registry().discover_servers().await;
//! println!("discovered {} servers", servers.len());
//! # Ok(())
//! # }
//! ```

// Core domain models
pub mod models;

// Engines: registry, router, connections, orchestrator, storage, events
pub mod engine;

// Resilience layer: retry, circuit breaker, checkpoints, fallback
pub mod resilience;

// Transport connector collaborators (stdio, http, websocket, scripted)
pub mod transport;

// Policy gate collaborator contract
pub mod policy;

// Environment and file configuration
pub mod config;

// Composition root
pub mod mesh;

// Re-export core domain types for easy access
pub use models::{
    CircuitBreakerStatus, CircuitState, Connection, ConnectionParams, ConnectionStatus,
    ExecutionStatus, MeshEvent, ServerDefinition, ServerMetadata, ServerSource, ServerStatus,
    StepKind, StepResult, Transport, WorkflowCheckpoint, WorkflowDefinition, WorkflowExecution,
    WorkflowStep,
};

// Re-export the engines
pub use engine::{
    connections::{ConnectionManager, TransportExpectation},
    events::EventBus,
    orchestrator::WorkflowOrchestrator,
    registry::{DiscoverySource, ServerRegistry, StaticDiscovery},
    router::{CapabilityMapping, CapabilityRouter},
    storage::{InMemoryStorage, MeshStorage},
};

// Re-export the resilience layer
pub use resilience::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CheckpointManager, FallbackHandler, FallbackSource, ResumeReport, RetryConfig, RetryOutcome,
    RetryRunner,
};

pub use config::MeshConfig;
pub use mesh::ToolMesh;
pub use policy::{AllowAllPolicy, PolicyDecision, PolicyGate};
pub use transport::{ScriptedConnector, TransportClient, TransportConnector};

// Core error types
use thiserror::Error;

/// Error taxonomy for mesh operations.
///
/// Validation, configuration, duplicate-id, and policy errors are fatal and
/// never retried. Connection and timeout errors are transient and eligible
/// for retry. `CircuitOpen` is distinct from a real operation failure so
/// callers can tell "the peer is failing" apart from "this call failed".
#[derive(Error, Debug)]
pub enum MeshError {
    /// A definition failed shape validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A server with this id is already registered
    #[error("Server already registered: {id}")]
    DuplicateServer { id: String },

    /// No server registered under this id
    #[error("Server not found: {id}")]
    ServerNotFound { id: String },

    /// No workflow stored under this id
    #[error("Workflow not found: {id}")]
    WorkflowNotFound { id: String },

    /// No checkpoint recorded for this workflow
    #[error("No checkpoint for workflow: {workflow_id}")]
    CheckpointNotFound { workflow_id: String },

    /// A caller-enforced transport/timeout contract was violated.
    /// Fatal and non-retryable; fix the configuration, not the network.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Establishing or using a connection failed
    #[error("Connection to {server_id} failed: {reason}")]
    Connection { server_id: String, reason: String },

    /// An operation exceeded its own timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The per-server circuit is open; the call was rejected without being
    /// attempted
    #[error("Circuit open for server {server_id}")]
    CircuitOpen { server_id: String },

    /// A step was skipped because one of its dependencies failed
    #[error("Step {step_id} blocked: dependency {dependency} failed")]
    DependencyBlocked { step_id: String, dependency: String },

    /// The policy gate rejected the operation
    #[error("Policy denied operation '{operation}': {violations:?}")]
    PolicyDenied {
        operation: String,
        violations: Vec<String>,
    },

    /// Transport-level send/receive failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Internal(err.to_string())
    }
}

impl MeshError {
    /// Errors that must never be retried, regardless of retry policy lists
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MeshError::Validation(_)
                | MeshError::DuplicateServer { .. }
                | MeshError::Configuration(_)
                | MeshError::PolicyDenied { .. }
                | MeshError::DependencyBlocked { .. }
                | MeshError::Serialization(_)
        )
    }

    /// Short kind label, matched alongside the message by the retry
    /// heuristic
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::Validation(_) => "validation",
            MeshError::DuplicateServer { .. } => "duplicate",
            MeshError::ServerNotFound { .. } => "not_found",
            MeshError::WorkflowNotFound { .. } => "not_found",
            MeshError::CheckpointNotFound { .. } => "not_found",
            MeshError::Configuration(_) => "configuration",
            MeshError::Connection { .. } => "connection",
            MeshError::Timeout { .. } => "timeout",
            MeshError::CircuitOpen { .. } => "circuit_open",
            MeshError::DependencyBlocked { .. } => "dependency_blocked",
            MeshError::PolicyDenied { .. } => "policy_denied",
            MeshError::Transport(_) => "transport",
            MeshError::Storage(_) => "storage",
            MeshError::Serialization(_) => "serialization",
            MeshError::Internal(_) => "internal",
        }
    }
}

/// Type alias for Results that use the mesh error type
pub type Result<T> = std::result::Result<T, MeshError>;
