//! Built-in handlers.
//!
//! Neither is special to the pool; both are ordinary [`JobHandler`]s.
//!
//! - [`WorkflowGraphHandler`] runs a fixed DAG of named async steps. Each step
//!   sees the accumulated state object and returns a value stored under its
//!   own name. The job payload seeds the state under `"input"`.
//! - [`CapabilityHandler`] picks a [`Capability`] by the payload's
//!   `"capability"` field and runs its `plan` then `execute`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use taskforge_core::{DomainError, DomainResult};

use super::handler::{HandlerError, JobContext, JobHandler};

type StepFuture = Pin<Box<dyn Future<Output = Result<JsonValue, HandlerError>> + Send>>;
type StepFn = Arc<dyn Fn(JsonValue) -> StepFuture + Send + Sync>;

struct Step {
    name: String,
    depends_on: Vec<String>,
    run: StepFn,
}

/// Builder for a workflow graph; see [`WorkflowGraph::build`].
#[derive(Default)]
pub struct WorkflowGraph {
    steps: Vec<Step>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step that runs after every step in `depends_on`.
    pub fn step<F, Fut>(mut self, name: impl Into<String>, depends_on: &[&str], run: F) -> Self
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, HandlerError>> + Send + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            run: Arc::new(move |state| -> StepFuture { Box::pin(run(state)) }),
        });
        self
    }

    /// Validate and fix the execution order.
    ///
    /// Fails on duplicate step names, unknown dependencies and cycles.
    pub fn build(self) -> DomainResult<WorkflowGraphHandler> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name == "input" {
                return Err(DomainError::validation("step name 'input' is reserved"));
            }
            if index.insert(step.name.as_str(), i).is_some() {
                return Err(DomainError::validation(format!("duplicate step '{}'", step.name)));
            }
        }

        let mut indegree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let &d = index.get(dep.as_str()).ok_or_else(|| {
                    DomainError::validation(format!("step '{}' depends on unknown step '{dep}'", step.name))
                })?;
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        // Kahn's algorithm; declaration order breaks ties.
        let mut ready: VecDeque<usize> = (0..self.steps.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if order.len() != self.steps.len() {
            return Err(DomainError::validation("workflow graph has a cycle"));
        }

        let mut slots: Vec<Option<Step>> = self.steps.into_iter().map(Some).collect();
        let steps = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(WorkflowGraphHandler { steps: Arc::new(steps) })
    }
}

/// Runs a validated workflow graph for every job.
#[derive(Clone)]
pub struct WorkflowGraphHandler {
    steps: Arc<Vec<Step>>,
}

impl std::fmt::Debug for WorkflowGraphHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraphHandler")
            .field("steps", &self.step_names())
            .finish()
    }
}

impl WorkflowGraphHandler {
    /// Steps in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

#[async_trait]
impl JobHandler for WorkflowGraphHandler {
    async fn handle(&self, job: &JobContext) -> Result<JsonValue, HandlerError> {
        let mut state = serde_json::Map::new();
        state.insert("input".to_string(), JsonValue::Object(job.payload.clone()));

        for step in self.steps.iter() {
            debug!(job_id = %job.id, step = %step.name, "workflow step started");
            let output = (step.run)(JsonValue::Object(state.clone()))
                .await
                .map_err(|e| HandlerError::Failed(format!("step '{}' failed: {e}", step.name)))?;
            state.insert(step.name.clone(), output);
        }
        Ok(JsonValue::Object(state))
    }
}

/// A single named unit of work with a separate planning phase.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    /// Turn the job payload into a plan. Rejecting the payload here skips `execute`.
    async fn plan(&self, job: &JobContext) -> Result<JsonValue, HandlerError>;

    async fn execute(&self, job: &JobContext, plan: JsonValue) -> Result<JsonValue, HandlerError>;
}

/// Dispatches on the payload's `"capability"` field.
#[derive(Default, Clone)]
pub struct CapabilityHandler {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl std::fmt::Debug for CapabilityHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityHandler")
            .field("capabilities", &self.capabilities.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CapabilityHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, capability: impl Capability + 'static) -> Self {
        self.capabilities
            .insert(capability.name().to_string(), Arc::new(capability));
        self
    }

    pub fn names(&self) -> HashSet<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl JobHandler for CapabilityHandler {
    async fn handle(&self, job: &JobContext) -> Result<JsonValue, HandlerError> {
        let name = job.str_field("capability")?;
        let capability = self
            .capabilities
            .get(name)
            .ok_or_else(|| HandlerError::InvalidPayload(format!("unknown capability '{name}'")))?;

        let plan = capability.plan(job).await?;
        let output = capability.execute(job, plan.clone()).await?;
        Ok(json!({ "capability": name, "plan": plan, "output": output }))
    }
}

/// Returns the payload's `"input"` field unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "system.echo"
    }

    async fn plan(&self, job: &JobContext) -> Result<JsonValue, HandlerError> {
        Ok(json!({ "steps": ["echo"], "attempt": job.attempt() }))
    }

    async fn execute(&self, job: &JobContext, _plan: JsonValue) -> Result<JsonValue, HandlerError> {
        Ok(job.payload.get("input").cloned().unwrap_or(JsonValue::Null))
    }
}
