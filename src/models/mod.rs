// Core domain models for Toolmesh
// Generic data structures shared by every engine component

//! # Domain Models Module
//!
//! The data model of the mesh: server definitions and their capabilities,
//! live connection records, workflow definitions and executions, checkpoint
//! snapshots, circuit breaker status views, and the observability events the
//! engines publish. Everything here is serde-serializable and free of engine
//! behavior.

// Server definitions, transports, discovery metadata
pub mod server;

// Live connection records owned by the connection manager
pub mod connection;

// Workflow definitions, steps, and execution state
pub mod workflow;

// Checkpoint snapshots for resume
pub mod checkpoint;

// Circuit breaker state and status views
pub mod breaker;

// Observability event payloads
pub mod events;

// Re-export the domain types for a flat API
pub use breaker::{CircuitBreakerStatus, CircuitState};
pub use checkpoint::{CheckpointMetadata, WorkflowCheckpoint};
pub use connection::{Connection, ConnectionStatus};
pub use events::MeshEvent;
pub use server::{
    ConflictStrategy, ConnectionParams, ServerDefinition, ServerMetadata, ServerSource,
    ServerStatus, Transport,
};
pub use workflow::{
    ExecutionStatus, StepKind, StepResult, StepRetryPolicy, WorkflowDefinition,
    WorkflowExecution, WorkflowStep,
};
