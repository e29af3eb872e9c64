// Workflow orchestrator: dependency-ordered execution over the mesh

//! # Workflow Orchestrator
//!
//! Drives one workflow execution through its step DAG. Steps whose
//! dependencies have all completed become eligible; eligible steps run as a
//! concurrent wave and the orchestrator joins on the wave before computing
//! the next one. Every remote call is wrapped retry-around-circuit-breaker,
//! a checkpoint is written after each completed step, and a step that
//! exhausts its retries takes down only the steps that transitively depend
//! on it. Partial completion is a first-class outcome.
//!
//! Recovery is reactive: when a remote step fails with a connection-class
//! error, the server's connection is marked lost and the step is offered
//! once to each fallback candidate sharing the capability, in priority
//! order, before being recorded as failed.

use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::connections::ConnectionManager;
use super::events::EventBus;
use super::registry::ServerRegistry;
use super::router::CapabilityRouter;
use super::storage::MeshStorage;
use crate::models::{
    CheckpointMetadata, ExecutionStatus, StepKind, StepResult, WorkflowDefinition,
    WorkflowExecution, WorkflowStep,
};
use crate::policy::PolicyGate;
use crate::resilience::{
    CheckpointManager, CircuitBreakerRegistry, FallbackHandler, ReplayedStep, ResumeReport,
    RetryConfig, RetryRunner,
};
use crate::{MeshError, Result};

/// The collaborators the orchestrator is wired from
pub struct OrchestratorParts {
    pub registry: Arc<ServerRegistry>,
    pub router: Arc<CapabilityRouter>,
    pub connections: Arc<ConnectionManager>,
    pub checkpoints: Arc<CheckpointManager>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub storage: Arc<dyn MeshStorage>,
    pub policy: Arc<dyn PolicyGate>,
    pub events: EventBus,
}

/// Top-level coordinator for workflow execution
pub struct WorkflowOrchestrator {
    registry: Arc<ServerRegistry>,
    router: Arc<CapabilityRouter>,
    connections: Arc<ConnectionManager>,
    checkpoints: Arc<CheckpointManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    storage: Arc<dyn MeshStorage>,
    policy: Arc<dyn PolicyGate>,
    events: EventBus,
    default_retry: RetryConfig,
    fallback_timeout_ms: u64,
}

impl WorkflowOrchestrator {
    pub fn new(parts: OrchestratorParts, default_retry: RetryConfig, fallback_timeout_ms: u64) -> Self {
        WorkflowOrchestrator {
            registry: parts.registry,
            router: parts.router,
            connections: parts.connections,
            checkpoints: parts.checkpoints,
            breakers: parts.breakers,
            storage: parts.storage,
            policy: parts.policy,
            events: parts.events,
            default_retry,
            fallback_timeout_ms,
        }
    }

    /// Execute a workflow to a terminal status.
    ///
    /// The returned execution reports every step's result; a failed step is
    /// never silently dropped. Final status: `completed` when every step
    /// completed, `failed` when nothing completed at all, `partial`
    /// otherwise.
    pub async fn execute_workflow(&self, definition: &WorkflowDefinition) -> Result<WorkflowExecution> {
        definition.validate().map_err(MeshError::Validation)?;
        self.storage.store_definition(definition).await?;

        let mut execution = WorkflowExecution::new(&definition.id);
        execution.context = Value::Object(Map::new());
        self.events
            .emit_workflow_started(&execution.id.to_string(), &definition.id);
        self.storage.store_execution(&execution).await?;

        let total_steps = definition.steps.len();
        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut completion_index = 0usize;

        loop {
            let wave: Vec<&WorkflowStep> = definition
                .steps
                .iter()
                .filter(|step| {
                    !completed.contains(&step.id)
                        && !failed.contains(&step.id)
                        && step.dependencies.iter().all(|dep| completed.contains(dep))
                })
                .collect();
            if wave.is_empty() {
                break;
            }

            debug!(
                workflow_id = %definition.id,
                steps = ?wave.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
                "executing wave"
            );
            execution.current_step = wave.first().map(|step| step.id.clone());
            let context_snapshot = execution.context.clone();
            let results = join_all(
                wave.iter()
                    .map(|step| self.execute_step(step, &context_snapshot)),
            )
            .await;

            for (step, result) in wave.iter().zip(results) {
                if result.success {
                    completed.insert(step.id.clone());
                    if let Some(output) = &result.output {
                        self.carry_into_context(&mut execution.context, step, output);
                    }
                    execution.record_success(result);
                    self.checkpoints
                        .create_checkpoint(
                            &definition.id,
                            completion_index,
                            step.id.clone(),
                            execution.context.clone(),
                            CheckpointMetadata {
                                total_steps,
                                completed_steps: completed.len(),
                                failed_steps: failed.len(),
                            },
                        )
                        .await;
                    completion_index += 1;
                } else {
                    warn!(
                        workflow_id = %definition.id,
                        step_id = %step.id,
                        error = ?result.error,
                        "step failed"
                    );
                    failed.insert(step.id.clone());
                    execution.record_failure(result);
                }
            }
        }

        // Whatever is left has a failed ancestor: mark the whole subtree as
        // blocked, cascading until nothing changes
        loop {
            let blocked: Vec<(String, String)> = definition
                .steps
                .iter()
                .filter(|step| !completed.contains(&step.id) && !failed.contains(&step.id))
                .filter_map(|step| {
                    step.dependencies
                        .iter()
                        .find(|dep| failed.contains(*dep))
                        .map(|dep| (step.id.clone(), dep.clone()))
                })
                .collect();
            if blocked.is_empty() {
                break;
            }
            for (step_id, dependency) in blocked {
                let err = MeshError::DependencyBlocked {
                    step_id: step_id.clone(),
                    dependency,
                };
                failed.insert(step_id.clone());
                execution.record_failure(StepResult::failure(step_id, err.to_string(), 0, 0));
            }
        }

        let status = if failed.is_empty() {
            ExecutionStatus::Completed
        } else if completed.is_empty() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Partial
        };
        if status == ExecutionStatus::Failed {
            execution.error = Some("no step completed".to_string());
        }
        execution.finish(status);
        self.storage.store_execution(&execution).await?;
        self.events.emit_workflow_finished(
            &execution.id.to_string(),
            status,
            execution.completed_steps.len(),
            execution.failed_steps.len(),
        );
        info!(
            workflow_id = %definition.id,
            status = ?status,
            completed = execution.completed_steps.len(),
            failed = execution.failed_steps.len(),
            "workflow finished"
        );
        Ok(execution)
    }

    /// Fan one operation out to every listed server concurrently and return
    /// the results of the servers that succeeded.
    ///
    /// Best-effort by contract: failures are logged and excluded from the
    /// map, the batch itself never aborts.
    pub async fn coordinate_multi_server_operation(
        &self,
        server_ids: &[String],
        operation: &str,
        params: &Value,
    ) -> std::collections::HashMap<String, Value> {
        let calls = server_ids.iter().map(|server_id| async move {
            let breaker = self.breakers.breaker_for(server_id);
            let result = breaker
                .call(|| self.connections.invoke(server_id, operation, params))
                .await;
            (server_id.clone(), result)
        });

        let mut successes = std::collections::HashMap::new();
        for (server_id, result) in join_all(calls).await {
            match result {
                Ok(value) => {
                    successes.insert(server_id, value);
                }
                Err(err) => {
                    warn!(server_id = %server_id, operation, error = %err, "fan-out call failed");
                }
            }
        }
        successes
    }

    /// Resume a workflow from its latest checkpoint, replaying only the
    /// steps after it (by definition order) and checkpointing each replay.
    pub async fn resume_workflow(&self, definition: &WorkflowDefinition) -> Result<ResumeReport> {
        definition.validate().map_err(MeshError::Validation)?;
        let steps = definition.steps.clone();

        self.checkpoints
            .resume_from_checkpoint(&definition.id, |index| {
                let steps = steps.clone();
                async move {
                    let step = steps.get(index).ok_or_else(|| {
                        MeshError::Internal(format!(
                            "checkpoint references step index {index} beyond the definition"
                        ))
                    })?;
                    let result = self.execute_step(step, &Value::Null).await;
                    if result.success {
                        Ok(ReplayedStep {
                            name: step.id.clone(),
                            state: result.output.unwrap_or(Value::Null),
                        })
                    } else {
                        Err(MeshError::Internal(
                            result
                                .error
                                .unwrap_or_else(|| format!("step '{}' failed during resume", step.id)),
                        ))
                    }
                }
            })
            .await
    }

    /// Deliberately suspend a running execution after its last checkpoint
    pub async fn suspend_execution(&self, execution_id: &uuid::Uuid) -> Result<WorkflowExecution> {
        let mut execution = self
            .storage
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| MeshError::WorkflowNotFound {
                id: execution_id.to_string(),
            })?;
        if execution.status == ExecutionStatus::Running {
            execution.status = ExecutionStatus::Paused;
            self.storage.store_execution(&execution).await?;
        }
        Ok(execution)
    }

    /// Execute one step against a context snapshot. Always returns a
    /// result; failures are data, not errors.
    async fn execute_step(&self, step: &WorkflowStep, context: &Value) -> StepResult {
        let started = Instant::now();
        match step.kind {
            StepKind::DataTransform => {
                let output = apply_transform(context, &step.parameters);
                StepResult::success(step.id.clone(), output, 1, elapsed_ms(started))
            }
            StepKind::RemoteCall => self.execute_remote_step(step, context, started).await,
        }
    }

    async fn execute_remote_step(
        &self,
        step: &WorkflowStep,
        context: &Value,
        started: Instant,
    ) -> StepResult {
        let decision = self.policy.validate(&step.operation, context).await;
        if !decision.allowed {
            let err = MeshError::PolicyDenied {
                operation: step.operation.clone(),
                violations: decision.violations,
            };
            return StepResult::failure(step.id.clone(), err.to_string(), 1, elapsed_ms(started));
        }

        let Some(server_id) = self.resolve_target(&step.target).await else {
            return StepResult::failure(
                step.id.clone(),
                format!("no server available for target '{}'", step.target),
                0,
                elapsed_ms(started),
            );
        };

        let retry_config = match step.retry_policy {
            Some(policy) => RetryConfig {
                max_retries: policy.max_retries,
                base_delay_ms: policy.backoff_ms,
                ..self.default_retry.clone()
            },
            None => self.default_retry.clone(),
        };
        let runner = RetryRunner::with_events(retry_config, self.events.clone());
        let breaker = self.breakers.breaker_for(&server_id);

        let outcome = runner
            .execute(&step.operation, || {
                let breaker = Arc::clone(&breaker);
                let connections = Arc::clone(&self.connections);
                let server_id = server_id.clone();
                let operation = step.operation.clone();
                let params = step.parameters.clone();
                async move {
                    breaker
                        .call(|| async move {
                            connections.invoke(&server_id, &operation, &params).await
                        })
                        .await
                }
            })
            .await;

        match outcome.result {
            Ok(value) => {
                StepResult::success(step.id.clone(), value, outcome.attempts, elapsed_ms(started))
            }
            Err(err) if is_connection_class(&err) => {
                self.connections.handle_disconnection(&server_id).await;
                match self.reroute_step(step, &server_id).await {
                    Some((value, source_id)) => {
                        info!(
                            step_id = %step.id,
                            failed_server = %server_id,
                            source_id = %source_id,
                            "step recovered through fallback server"
                        );
                        StepResult::success(
                            step.id.clone(),
                            value,
                            outcome.attempts + 1,
                            elapsed_ms(started),
                        )
                    }
                    None => StepResult::failure(
                        step.id.clone(),
                        err.to_string(),
                        outcome.attempts,
                        elapsed_ms(started),
                    ),
                }
            }
            Err(err) => StepResult::failure(
                step.id.clone(),
                err.to_string(),
                outcome.attempts,
                elapsed_ms(started),
            ),
        }
    }

    /// Explicit server id wins; anything else is treated as a capability
    /// for the router to resolve
    async fn resolve_target(&self, target: &str) -> Option<String> {
        if self.registry.get_server(target).await.is_ok() {
            return Some(target.to_string());
        }
        self.router.select_server_for_capability(target).await
    }

    /// Offer the step once to each server sharing the capability, in
    /// priority order, under one shared timeout
    async fn reroute_step(&self, step: &WorkflowStep, failed_server: &str) -> Option<(Value, String)> {
        let options = self
            .connections
            .provide_fallback_options(failed_server)
            .await
            .ok()?;
        let candidates: Vec<_> = options
            .into_iter()
            .filter(|candidate| candidate.has_capability(&step.operation))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let handler = FallbackHandler::new(&step.operation, failed_server, self.fallback_timeout_ms)
            .with_events(self.events.clone());
        // The primary already exhausted its retries; only alternates get a shot
        handler.set_enabled(failed_server, false).await;
        for candidate in &candidates {
            handler
                .add_source(&candidate.id, candidate.metadata.source.priority())
                .await;
        }

        let outcome = handler
            .execute(|source_id| {
                let params = step.parameters.clone();
                let operation = step.operation.clone();
                async move { self.connections.invoke(&source_id, &operation, &params).await }
            })
            .await
            .ok()?;
        Some((outcome.value, outcome.source_id))
    }

    /// Stash a completed step's output into the carried context
    fn carry_into_context(&self, context: &mut Value, step: &WorkflowStep, output: &Value) {
        match step.kind {
            // Transforms replace the context wholesale
            StepKind::DataTransform => *context = output.clone(),
            StepKind::RemoteCall => {
                if let Value::Object(map) = context {
                    map.insert(step.id.clone(), output.clone());
                }
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn is_connection_class(err: &MeshError) -> bool {
    matches!(
        err,
        MeshError::Connection { .. }
            | MeshError::Timeout { .. }
            | MeshError::Transport(_)
            | MeshError::CircuitOpen { .. }
    )
}

/// Shallow merge of transform parameters over the carried context
fn apply_transform(context: &Value, parameters: &Value) -> Value {
    match (context, parameters) {
        (Value::Object(ctx), Value::Object(params)) => {
            let mut merged = ctx.clone();
            for (key, value) in params {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, params) => params.clone(),
    }
}
