// Workflow progress snapshots used for resume after interruption

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Aggregate step counts at the moment the checkpoint was taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
}

/// An immutable snapshot of workflow progress.
///
/// Checkpoints are append-only per workflow and ring-bounded: once the
/// per-workflow cap is reached the oldest entry is evicted. Their only
/// consumer is resume-after-interruption; they are not an audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub id: Uuid,
    pub workflow_id: String,
    /// Index of the last completed step. Resume replays strictly greater
    /// indices only.
    pub step_index: usize,
    pub step_name: String,
    /// Carried workflow state at snapshot time
    pub state: Value,
    pub timestamp: DateTime<Utc>,
    pub metadata: CheckpointMetadata,
}

impl WorkflowCheckpoint {
    pub fn new<W: Into<String>, N: Into<String>>(
        workflow_id: W,
        step_index: usize,
        step_name: N,
        state: Value,
        metadata: CheckpointMetadata,
    ) -> Self {
        WorkflowCheckpoint {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            step_index,
            step_name: step_name.into(),
            state,
            timestamp: Utc::now(),
            metadata,
        }
    }
}
