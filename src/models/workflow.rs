// Workflow definitions and runtime execution state

//! # Workflow Definitions
//!
//! A `WorkflowDefinition` is a DAG of steps. Each step invokes one operation
//! on a target server (or on whichever server the capability router picks)
//! and may depend on other steps; a step never starts before every declared
//! dependency has completed. A `WorkflowExecution` is the runtime record of
//! one run: which steps completed, which failed, and every step's result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// The closed set of step kinds a workflow can contain.
///
/// Dispatch happens through one exhaustive match in the orchestrator, so an
/// unknown kind is unrepresentable rather than a runtime lookup failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke an operation on a remote tool server
    RemoteCall,
    /// Reshape carried context locally, no server involved
    DataTransform,
}

/// Per-step retry override. Steps without one use the configured defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

/// One unit of work inside a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the workflow
    pub id: String,
    pub kind: StepKind,
    /// A server id, or a capability name for the router to resolve
    pub target: String,
    pub operation: String,
    #[serde(default)]
    pub parameters: Value,
    /// Step ids that must be completed before this step becomes eligible
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub retry_policy: Option<StepRetryPolicy>,
}

impl WorkflowStep {
    pub fn remote_call<I, T, O>(id: I, target: T, operation: O) -> Self
    where
        I: Into<String>,
        T: Into<String>,
        O: Into<String>,
    {
        WorkflowStep {
            id: id.into(),
            kind: StepKind::RemoteCall,
            target: target.into(),
            operation: operation.into(),
            parameters: Value::Null,
            dependencies: Vec::new(),
            retry_policy: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn depends_on<S: Into<String>>(mut self, step_id: S) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_retry(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.retry_policy = Some(StepRetryPolicy {
            max_retries,
            backoff_ms,
        });
        self
    }
}

/// A complete multi-step workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new<S: Into<String>, N: Into<String>>(
        id: S,
        name: N,
        steps: Vec<WorkflowStep>,
    ) -> Self {
        WorkflowDefinition {
            id: id.into(),
            name: name.into(),
            steps,
        }
    }

    /// Steps with no dependencies. Execution starts here; if every entry
    /// step fails the whole run fails.
    pub fn entry_steps(&self) -> Vec<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .collect()
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Validate the step graph: step ids unique, every dependency refers to
    /// a step in this workflow, and the graph contains no cycles.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err(format!("workflow '{}' has no steps", self.id));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(format!(
                    "workflow '{}' contains duplicate step id '{}'",
                    self.id, step.id
                ));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ));
                }
                if dep == &step.id {
                    return Err(format!("step '{}' depends on itself", step.id));
                }
            }
        }

        // Kahn's algorithm: if topological processing cannot consume every
        // step, the leftovers form a cycle.
        let mut in_degree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.dependencies.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.dependencies {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut processed = 0usize;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if processed != self.steps.len() {
            return Err(format!(
                "workflow '{}' contains a dependency cycle",
                self.id
            ));
        }

        Ok(())
    }
}

/// Terminal and non-terminal states of one workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    /// Some steps completed, some failed. A first-class outcome, not an error.
    Partial,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Partial
        )
    }
}

/// Result of one step within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success<S: Into<String>>(
        step_id: S,
        output: Value,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        StepResult {
            step_id: step_id.into(),
            success: true,
            output: Some(output),
            error: None,
            attempts,
            duration_ms,
        }
    }

    pub fn failure<S: Into<String>, E: Into<String>>(
        step_id: S,
        error: E,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        StepResult {
            step_id: step_id.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            attempts,
            duration_ms,
        }
    }
}

/// Runtime state of one run of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub definition_id: String,
    pub status: ExecutionStatus,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub step_results: HashMap<String, StepResult>,
    /// Free-form state carried across steps
    pub context: Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new<S: Into<String>>(definition_id: S) -> Self {
        WorkflowExecution {
            id: Uuid::new_v4(),
            definition_id: definition_id.into(),
            status: ExecutionStatus::Running,
            current_step: None,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            step_results: HashMap::new(),
            context: Value::Null,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    pub fn record_success(&mut self, result: StepResult) {
        self.completed_steps.push(result.step_id.clone());
        self.step_results.insert(result.step_id.clone(), result);
    }

    pub fn record_failure(&mut self, result: StepResult) {
        self.failed_steps.push(result.step_id.clone());
        self.step_results.insert(result.step_id.clone(), result);
    }

    /// Move to a terminal status and stamp the end time
    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.current_step = None;
        self.ended_at = Some(Utc::now());
    }
}
