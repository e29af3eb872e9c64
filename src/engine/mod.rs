// Toolmesh engines
// Registry, router, connections, and the workflow orchestrator

//! # Engine Module
//!
//! The engines that do the coordinating, layered leaves-first:
//!
//! - **Registry** (`registry`): server discovery, registration, capability
//!   indexing. The source of truth for what servers exist.
//! - **Capability Router** (`router`): derived capability-to-servers view
//!   with conflict resolution, rebuilt from registry state.
//! - **Connection Manager** (`connections`): per-transport session
//!   establishment, staleness monitoring, fallback option listing.
//! - **Workflow Orchestrator** (`orchestrator`): dependency-ordered step
//!   execution wrapped in the resilience layer, multi-server fan-out, and
//!   checkpoint-based resume.
//! - **Storage** (`storage`): the persistence collaborator contract plus the
//!   in-memory implementation.
//! - **Events** (`events`): the broadcast bus the engines publish
//!   observability events on.
//!
//! Lock order across engines is registry before connection manager; see the
//! connection manager docs.

pub mod connections;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod storage;

// Re-export the engine types for clean API access
pub use connections::{ConnectionManager, TransportExpectation};
pub use events::EventBus;
pub use orchestrator::{OrchestratorParts, WorkflowOrchestrator};
pub use registry::{DiscoverySource, ServerRegistry, StaticDiscovery};
pub use router::{CapabilityCandidate, CapabilityEntry, CapabilityMapping, CapabilityRouter};
pub use storage::{InMemoryStorage, MeshStorage};
