// Bounded checkpoint log and resume-after-interruption

//! # Checkpoint Manager
//!
//! Keeps a bounded, append-only log of workflow progress snapshots keyed by
//! workflow id. Checkpoints for one workflow are strictly increasing by step
//! index; once the per-workflow cap is exceeded the oldest entry is evicted.
//! Resume replays only steps with an index strictly greater than the latest
//! checkpoint's, writing a fresh checkpoint after each replayed step.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::engine::events::EventBus;
use crate::models::{CheckpointMetadata, WorkflowCheckpoint};
use crate::{MeshError, Result};

/// A step re-executed during resume: its name and the state to snapshot
#[derive(Debug, Clone)]
pub struct ReplayedStep {
    pub name: String,
    pub state: Value,
}

/// Outcome of a resume pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeReport {
    pub success: bool,
    /// Steps completed across the original run and the replay
    pub completed_steps: usize,
    pub total_steps: usize,
    /// Index of the replayed step that failed, when one did
    pub failed_step: Option<usize>,
}

/// Ring-bounded checkpoint store
pub struct CheckpointManager {
    max_per_workflow: usize,
    checkpoints: RwLock<HashMap<String, VecDeque<WorkflowCheckpoint>>>,
    events: Option<EventBus>,
}

impl CheckpointManager {
    pub fn new(max_per_workflow: usize) -> Self {
        CheckpointManager {
            max_per_workflow: max_per_workflow.max(1),
            checkpoints: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(max_per_workflow: usize, events: EventBus) -> Self {
        CheckpointManager {
            max_per_workflow: max_per_workflow.max(1),
            checkpoints: RwLock::new(HashMap::new()),
            events: Some(events),
        }
    }

    /// Append a checkpoint, evicting the oldest once the cap is exceeded
    pub async fn create_checkpoint<N: Into<String>>(
        &self,
        workflow_id: &str,
        step_index: usize,
        step_name: N,
        state: Value,
        metadata: CheckpointMetadata,
    ) -> WorkflowCheckpoint {
        let checkpoint =
            WorkflowCheckpoint::new(workflow_id, step_index, step_name, state, metadata);

        {
            let mut store = self.checkpoints.write().await;
            let log = store.entry(workflow_id.to_string()).or_default();
            log.push_back(checkpoint.clone());
            while log.len() > self.max_per_workflow {
                log.pop_front();
            }
        }

        debug!(workflow_id, step_index, "checkpoint recorded");
        if let Some(events) = &self.events {
            events.emit_checkpoint_created(workflow_id, step_index);
        }
        checkpoint
    }

    pub async fn get_latest_checkpoint(&self, workflow_id: &str) -> Option<WorkflowCheckpoint> {
        let store = self.checkpoints.read().await;
        store.get(workflow_id).and_then(|log| log.back().cloned())
    }

    pub async fn get_checkpoints_for_workflow(&self, workflow_id: &str) -> Vec<WorkflowCheckpoint> {
        let store = self.checkpoints.read().await;
        store
            .get(workflow_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove one checkpoint by id; true when something was deleted
    pub async fn delete_checkpoint(&self, checkpoint_id: &Uuid) -> bool {
        let mut store = self.checkpoints.write().await;
        for log in store.values_mut() {
            if let Some(pos) = log.iter().position(|cp| &cp.id == checkpoint_id) {
                log.remove(pos);
                return true;
            }
        }
        false
    }

    /// Drop every checkpoint for a workflow; returns how many were removed
    pub async fn clear_workflow_checkpoints(&self, workflow_id: &str) -> usize {
        let mut store = self.checkpoints.write().await;
        store.remove(workflow_id).map(|log| log.len()).unwrap_or(0)
    }

    /// Resume a workflow from its latest checkpoint.
    ///
    /// Replays only steps with index strictly greater than the checkpoint's
    /// `step_index`, re-checkpointing after each. The total step count comes
    /// from the checkpoint's metadata. Stops at the first replay failure.
    pub async fn resume_from_checkpoint<F, Fut>(
        &self,
        workflow_id: &str,
        mut step_executor: F,
    ) -> Result<ResumeReport>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<ReplayedStep>>,
    {
        let latest = self
            .get_latest_checkpoint(workflow_id)
            .await
            .ok_or_else(|| MeshError::CheckpointNotFound {
                workflow_id: workflow_id.to_string(),
            })?;

        let total_steps = latest.metadata.total_steps;
        let mut completed = latest.step_index + 1;

        for index in (latest.step_index + 1)..total_steps {
            match step_executor(index).await {
                Ok(replayed) => {
                    completed += 1;
                    self.create_checkpoint(
                        workflow_id,
                        index,
                        replayed.name,
                        replayed.state,
                        CheckpointMetadata {
                            total_steps,
                            completed_steps: completed,
                            failed_steps: latest.metadata.failed_steps,
                        },
                    )
                    .await;
                }
                Err(err) => {
                    debug!(workflow_id, index, error = %err, "resume halted");
                    return Ok(ResumeReport {
                        success: false,
                        completed_steps: completed,
                        total_steps,
                        failed_step: Some(index),
                    });
                }
            }
        }

        Ok(ResumeReport {
            success: true,
            completed_steps: completed,
            total_steps,
            failed_step: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn metadata(total: usize, completed: usize) -> CheckpointMetadata {
        CheckpointMetadata {
            total_steps: total,
            completed_steps: completed,
            failed_steps: 0,
        }
    }

    #[tokio::test]
    async fn test_checkpoints_append_in_order() {
        let manager = CheckpointManager::new(10);
        for index in 0..3 {
            manager
                .create_checkpoint("wf", index, format!("step-{index}"), Value::Null, metadata(5, index + 1))
                .await;
        }

        let log = manager.get_checkpoints_for_workflow("wf").await;
        assert_eq!(log.len(), 3);
        let indices: Vec<usize> = log.iter().map(|cp| cp.step_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let latest = manager.get_latest_checkpoint("wf").await.unwrap();
        assert_eq!(latest.step_index, 2);
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest() {
        let manager = CheckpointManager::new(3);
        for index in 0..5 {
            manager
                .create_checkpoint("wf", index, "step", Value::Null, metadata(5, index + 1))
                .await;
        }

        let log = manager.get_checkpoints_for_workflow("wf").await;
        let indices: Vec<usize> = log.iter().map(|cp| cp.step_index).collect();
        assert_eq!(indices, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let manager = CheckpointManager::new(10);
        let cp = manager
            .create_checkpoint("wf", 0, "step", Value::Null, metadata(2, 1))
            .await;
        manager
            .create_checkpoint("wf", 1, "step", Value::Null, metadata(2, 2))
            .await;

        assert!(manager.delete_checkpoint(&cp.id).await);
        assert!(!manager.delete_checkpoint(&cp.id).await);
        assert_eq!(manager.clear_workflow_checkpoints("wf").await, 1);
        assert!(manager.get_latest_checkpoint("wf").await.is_none());
    }

    #[tokio::test]
    async fn test_resume_replays_only_later_steps() {
        let manager = CheckpointManager::new(10);
        manager
            .create_checkpoint("wf", 2, "third", json!({"done": 3}), metadata(5, 3))
            .await;

        let replayed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&replayed);
        let report = manager
            .resume_from_checkpoint("wf", move |index| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(index);
                    Ok(ReplayedStep {
                        name: format!("step-{index}"),
                        state: Value::Null,
                    })
                }
            })
            .await
            .unwrap();

        // Only steps 3 and 4, in order
        assert_eq!(replayed.lock().unwrap().clone(), vec![3, 4]);
        assert!(report.success);
        assert_eq!(report.completed_steps, 5);
        assert_eq!(report.total_steps, 5);

        // Replay wrote fresh checkpoints
        let latest = manager.get_latest_checkpoint("wf").await.unwrap();
        assert_eq!(latest.step_index, 4);
    }

    #[tokio::test]
    async fn test_resume_stops_on_failure() {
        let manager = CheckpointManager::new(10);
        manager
            .create_checkpoint("wf", 1, "second", Value::Null, metadata(5, 2))
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let report = manager
            .resume_from_checkpoint("wf", move |index| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if index == 3 {
                        Err(MeshError::Timeout { timeout_ms: 10 })
                    } else {
                        Ok(ReplayedStep {
                            name: format!("step-{index}"),
                            state: Value::Null,
                        })
                    }
                }
            })
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.failed_step, Some(3));
        // Step 2 replayed fine, step 3 failed, step 4 never ran
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.completed_steps, 3);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_fails() {
        let manager = CheckpointManager::new(10);
        let result = manager
            .resume_from_checkpoint("ghost", |_| async {
                Ok(ReplayedStep {
                    name: "step".to_string(),
                    state: Value::Null,
                })
            })
            .await;
        assert!(matches!(
            result,
            Err(MeshError::CheckpointNotFound { .. })
        ));
    }
}
