// Storage abstraction for workflow definitions and executions

//! # Storage Abstraction Layer
//!
//! Persistence is an external collaborator: the engine treats it as a
//! key-addressed store for workflow definitions and execution records, not
//! relational logic. [`MeshStorage`] defines the contract; the in-memory
//! implementation backs development and tests, and network-backed
//! implementations can slot in without touching the orchestrator.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{WorkflowDefinition, WorkflowExecution};
use crate::Result;

/// Key-addressed persistence contract for workflow state
#[async_trait::async_trait]
pub trait MeshStorage: Send + Sync {
    // Workflow definitions
    async fn store_definition(&self, definition: &WorkflowDefinition) -> Result<()>;
    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>>;
    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>>;
    async fn delete_definition(&self, id: &str) -> Result<bool>;

    // Workflow executions
    async fn store_execution(&self, execution: &WorkflowExecution) -> Result<()>;
    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>>;
    async fn list_executions_for_definition(
        &self,
        definition_id: &str,
    ) -> Result<Vec<WorkflowExecution>>;
}

/// In-memory implementation of MeshStorage for development/testing
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        InMemoryStorage::default()
    }
}

#[async_trait::async_trait]
impl MeshStorage for InMemoryStorage {
    async fn store_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        let mut definitions = self.definitions.write().await;
        definitions.insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        let mut all: Vec<WorkflowDefinition> = definitions.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn delete_definition(&self, id: &str) -> Result<bool> {
        let mut definitions = self.definitions.write().await;
        Ok(definitions.remove(id).is_some())
    }

    async fn store_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut executions = self.executions.write().await;
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>> {
        let executions = self.executions.read().await;
        Ok(executions.get(id).cloned())
    }

    async fn list_executions_for_definition(
        &self,
        definition_id: &str,
    ) -> Result<Vec<WorkflowExecution>> {
        let executions = self.executions.read().await;
        let mut found: Vec<WorkflowExecution> = executions
            .values()
            .filter(|exec| exec.definition_id == definition_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkflowStep;

    fn definition(id: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(
            id,
            "Test",
            vec![WorkflowStep::remote_call("step", "srv", "op")],
        )
    }

    #[tokio::test]
    async fn test_definition_round_trip() {
        let storage = InMemoryStorage::new();
        storage.store_definition(&definition("wf")).await.unwrap();

        let loaded = storage.get_definition("wf").await.unwrap().unwrap();
        assert_eq!(loaded.id, "wf");
        assert!(storage.get_definition("ghost").await.unwrap().is_none());

        assert!(storage.delete_definition("wf").await.unwrap());
        assert!(!storage.delete_definition("wf").await.unwrap());
    }

    #[tokio::test]
    async fn test_executions_are_listed_per_definition() {
        let storage = InMemoryStorage::new();
        let exec_a = WorkflowExecution::new("wf-a");
        let exec_b = WorkflowExecution::new("wf-b");
        storage.store_execution(&exec_a).await.unwrap();
        storage.store_execution(&exec_b).await.unwrap();

        let found = storage.list_executions_for_definition("wf-a").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, exec_a.id);

        let loaded = storage.get_execution(&exec_b.id).await.unwrap().unwrap();
        assert_eq!(loaded.definition_id, "wf-b");
    }
}
