//! Workflow scheduler: builds task graphs and runs them in dependency waves,
//! resolving agents through the registry and persisting results to memory.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::{
    agent::{Agent, AgentStatus, Document},
    cancel::{CancellationSignal, CancellationSwitch},
    error::{AgentError, TaskError, WorkflowError},
    memory::MemoryManager,
    registry::AgentRegistry,
    settings::OrchestratorConfig,
    workflow::{
        TaskEnvelope, TaskStatus, Workflow, WorkflowStatusReport, WorkflowSummary, WorkflowTask,
    },
};

/// Key under which dependency outputs are injected into a task's input.
pub const PREVIOUS_RESULTS_KEY: &str = "previous_results";

/// Invoked with a task's result after it has been persisted.
pub type TaskCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type WaveOutcome = (String, String, Result<Value, TaskError>);

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    memory: MemoryManager,
    config: OrchestratorConfig,
    workflows: RwLock<BTreeMap<String, Workflow>>,
    callbacks: RwLock<BTreeMap<String, Vec<TaskCallback>>>,
    agent_locks: DashMap<String, Arc<Mutex<()>>>,
    running: DashMap<String, CancellationSwitch>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        memory: MemoryManager,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            memory,
            config,
            workflows: RwLock::new(BTreeMap::new()),
            callbacks: RwLock::new(BTreeMap::new()),
            agent_locks: DashMap::new(),
            running: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one task outside any workflow. Failures of any kind come back
    /// as an unsuccessful envelope.
    #[instrument(skip(self, input), fields(agent = %agent_name))]
    pub async fn execute_single_task(&self, agent_name: &str, input: Document) -> TaskEnvelope {
        match self
            .run_task(agent_name, input, CancellationSignal::never())
            .await
        {
            Ok(result) => TaskEnvelope::success(agent_name, result),
            Err(e) => TaskEnvelope::failure(agent_name, e),
        }
    }

    async fn run_task(
        &self,
        agent_name: &str,
        input: Document,
        cancel: CancellationSignal,
    ) -> Result<Value, TaskError> {
        let agent = match self.registry.get_agent(agent_name) {
            Ok(agent) => agent,
            Err(e) => {
                error!("Agent '{}' not available: {}", agent_name, e);
                return Err(e.into());
            }
        };

        if self.config.validate_capabilities {
            check_input_kind(agent.as_ref(), &input)?;
        }

        let _guard = if self.config.serialize_agent_execution {
            let lock = self.agent_lock(agent_name);
            tokio::select! {
                guard = lock.lock_owned() => Some(guard),
                _ = cancel.cancelled() => {
                    return Err(TaskError::Cancelled { agent: agent_name.to_string() });
                }
            }
        } else {
            None
        };

        info!("Executing task with agent '{}'", agent_name);
        agent.context().set_status(AgentStatus::Running)?;

        let seconds = self.config.task_timeout_seconds;
        let execution = AssertUnwindSafe(agent.execute(input, cancel.clone())).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::Cancelled { agent: agent_name.to_string() }),
            finished = tokio::time::timeout(Duration::from_secs(seconds), execution) => {
                match finished {
                    Ok(Ok(Ok(value))) => Ok(value),
                    Ok(Ok(Err(e))) => Err(TaskError::Execution {
                        agent: agent_name.to_string(),
                        message: format!("{:#}", e),
                    }),
                    Ok(Err(_)) => Err(TaskError::Panicked { agent: agent_name.to_string() }),
                    Err(_) => Err(TaskError::Timeout { agent: agent_name.to_string(), seconds }),
                }
            }
        };

        let outcome = match outcome {
            Ok(value) if self.config.validate_capabilities => {
                check_output_kind(agent.as_ref(), &value).map(|()| value)
            }
            other => other,
        };

        match &outcome {
            Ok(_) => {
                let _ = agent.context().set_status(AgentStatus::Idle);
                info!("Task completed successfully with agent '{}'", agent_name);
            }
            Err(e) => {
                let _ = agent.context().set_status(AgentStatus::Error);
                error!("Task failed with agent '{}': {}", agent_name, e);
            }
        }
        outcome
    }

    fn agent_lock(&self, agent_name: &str) -> Arc<Mutex<()>> {
        self.agent_locks
            .entry(agent_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn create_workflow(
        &self,
        workflow_id: &str,
        name: &str,
        description: &str,
    ) -> Result<(), WorkflowError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(workflow_id) {
            return Err(WorkflowError::AlreadyExists(workflow_id.to_string()));
        }
        workflows.insert(
            workflow_id.to_string(),
            Workflow::new(workflow_id, name, description),
        );
        info!("Created workflow: {} ({})", name, workflow_id);
        Ok(())
    }

    /// Append a pending task. The agent must be registered and enabled; it
    /// is not instantiated here. Dependencies may name tasks added later and
    /// are checked when the workflow starts.
    pub fn add_task_to_workflow(
        &self,
        workflow_id: &str,
        task_id: &str,
        agent_name: &str,
        input: Document,
        dependencies: Vec<String>,
    ) -> Result<(), WorkflowError> {
        match self.registry.is_enabled(agent_name) {
            None => {
                error!("Agent '{}' not available", agent_name);
                return Err(AgentError::NotFound(agent_name.to_string()).into());
            }
            Some(false) => {
                error!("Agent '{}' not available", agent_name);
                return Err(AgentError::Disabled(agent_name.to_string()).into());
            }
            Some(true) => {}
        }

        if dependencies.iter().any(|d| d == task_id) {
            return Err(WorkflowError::SelfDependency(task_id.to_string()));
        }

        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;

        if workflow.status != TaskStatus::Pending {
            return Err(WorkflowError::Frozen(workflow_id.to_string()));
        }
        if workflow.task(task_id).is_some() {
            return Err(WorkflowError::DuplicateTask {
                workflow: workflow_id.to_string(),
                task: task_id.to_string(),
            });
        }

        workflow
            .tasks
            .push(WorkflowTask::new(task_id, agent_name, input, dependencies));
        info!("Added task '{}' to workflow '{}'", task_id, workflow_id);
        Ok(())
    }

    /// Run every task of a pending workflow in dependency waves.
    ///
    /// Returns a summary once no task can make further progress. Raises
    /// only when pending tasks remain that can never become ready, after
    /// marking the workflow failed.
    #[instrument(skip(self))]
    pub async fn execute_workflow(&self, workflow_id: &str) -> Result<WorkflowSummary, WorkflowError> {
        let started = Instant::now();
        let cancel = {
            let mut workflows = self.workflows.write();
            let workflow = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;

            if workflow.status != TaskStatus::Pending {
                return Err(WorkflowError::AlreadyExecuted {
                    workflow: workflow_id.to_string(),
                    status: workflow.status.to_string(),
                });
            }
            if let Some((task, dependency)) = workflow.unknown_dependency() {
                return Err(WorkflowError::UnknownDependency { task, dependency });
            }

            workflow.status = TaskStatus::Running;
            info!("Starting workflow: {} ({} tasks)", workflow.name, workflow.tasks.len());

            let switch = CancellationSwitch::new();
            let signal = switch.signal();
            self.running.insert(workflow_id.to_string(), switch);
            signal
        };
        let mut guard = RunGuard::new(self, workflow_id);

        let mut completed: HashSet<String> = HashSet::new();
        let mut results: BTreeMap<String, Value> = BTreeMap::new();

        loop {
            let wave = match self.next_wave(workflow_id, &completed, &results, &cancel) {
                Ok(wave) => wave,
                Err(e) => {
                    guard.disarm();
                    let _ = self.finish(workflow_id, TaskStatus::Failed);
                    error!("Workflow '{}' failed: {}", workflow_id, e);
                    return Err(e);
                }
            };
            if wave.is_empty() {
                break;
            }

            info!(
                "Dispatching wave of {} task(s) in workflow '{}'",
                wave.len(),
                workflow_id
            );
            let outcomes: Vec<WaveOutcome> = join_all(wave.into_iter().map(
                |(task_id, agent_name, input)| {
                    let cancel = cancel.clone();
                    async move {
                        let outcome = self.run_task(&agent_name, input, cancel).await;
                        (task_id, agent_name, outcome)
                    }
                },
            ))
            .await;

            for (task_id, agent_name, outcome) in outcomes {
                match outcome {
                    Ok(result) => {
                        self.update_task(workflow_id, &task_id, |task| {
                            task.status = TaskStatus::Completed;
                            task.result = Some(result.clone());
                            task.completed_at = Some(Utc::now());
                        });
                        completed.insert(task_id.clone());
                        results.insert(task_id.clone(), result.clone());
                        info!("Task '{}' completed successfully", task_id);

                        if !self
                            .memory
                            .store_workflow_result(workflow_id, &agent_name, &task_id, result.clone())
                            .await
                        {
                            warn!("Result of task '{}' was not persisted", task_id);
                        }
                        self.trigger_task_callbacks(&task_id, result).await;
                    }
                    Err(e) => {
                        let message = e.to_string();
                        self.update_task(workflow_id, &task_id, |task| {
                            task.status = TaskStatus::Failed;
                            task.error = Some(message.clone());
                            task.completed_at = Some(Utc::now());
                        });
                        error!("Task '{}' failed: {}", task_id, message);
                    }
                }
            }
        }

        guard.disarm();
        let workflow = self.finish(workflow_id, TaskStatus::Completed)?;
        let summary = WorkflowSummary {
            workflow_id: workflow_id.to_string(),
            success: workflow.count(TaskStatus::Failed) == 0,
            total_tasks: workflow.tasks.len(),
            successful_tasks: workflow.count(TaskStatus::Completed),
            failed_tasks: workflow.count(TaskStatus::Failed),
            task_results: results,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        };
        info!(
            "Workflow '{}' completed: {}/{} tasks successful",
            workflow.name, summary.successful_tasks, summary.total_tasks
        );
        Ok(summary)
    }

    /// Mark the next ready wave running and return `(task, agent, input)`
    /// for each, with dependency results injected. An empty wave means
    /// nothing is left to run.
    fn next_wave(
        &self,
        workflow_id: &str,
        completed: &HashSet<String>,
        results: &BTreeMap<String, Value>,
        cancel: &CancellationSignal,
    ) -> Result<Vec<(String, String, Document)>, WorkflowError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;

        if cancel.is_cancelled() {
            let now = Utc::now();
            for task in workflow
                .tasks
                .iter_mut()
                .filter(|t| t.status == TaskStatus::Pending)
            {
                task.status = TaskStatus::Failed;
                task.error = Some(
                    TaskError::Cancelled {
                        agent: task.agent_name.clone(),
                    }
                    .to_string(),
                );
                task.completed_at = Some(now);
            }
            warn!("Workflow '{}' cancelled", workflow_id);
            return Ok(Vec::new());
        }

        let ready = workflow.ready_tasks(completed);
        if ready.is_empty() {
            if workflow.count(TaskStatus::Pending) > 0 {
                return Err(WorkflowError::Blocked {
                    workflow: workflow_id.to_string(),
                    reason: workflow.classify_block(),
                });
            }
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut wave = Vec::with_capacity(ready.len());
        for task_id in ready {
            if let Some(task) = workflow.task_mut(&task_id) {
                task.status = TaskStatus::Running;
                task.started_at = Some(now);

                let previous: Document = task
                    .dependencies
                    .iter()
                    .map(|dep| (dep.clone(), results.get(dep).cloned().unwrap_or(Value::Null)))
                    .collect();
                let mut input = task.input.clone();
                input.insert(PREVIOUS_RESULTS_KEY.to_string(), Value::Object(previous));
                wave.push((task_id, task.agent_name.clone(), input));
            }
        }
        Ok(wave)
    }

    fn update_task(&self, workflow_id: &str, task_id: &str, apply: impl FnOnce(&mut WorkflowTask)) {
        if let Some(task) = self
            .workflows
            .write()
            .get_mut(workflow_id)
            .and_then(|w| w.task_mut(task_id))
        {
            apply(task);
        }
    }

    /// Set the terminal status, drop the cancellation switch and return a
    /// snapshot of the finished workflow.
    fn finish(&self, workflow_id: &str, status: TaskStatus) -> Result<Workflow, WorkflowError> {
        self.running.remove(workflow_id);
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        workflow.status = status;
        workflow.completed_at = Some(Utc::now());
        Ok(workflow.clone())
    }

    /// Register `callback` to run after `task_id` completes in any workflow.
    /// Callbacks run in registration order; their failures are logged only.
    pub fn register_task_callback<F, Fut>(&self, task_id: &str, callback: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: TaskCallback = Arc::new(move |result| callback(result).boxed());
        self.callbacks
            .write()
            .entry(task_id.to_string())
            .or_default()
            .push(callback);
    }

    async fn trigger_task_callbacks(&self, task_id: &str, result: Value) {
        let callbacks = match self.callbacks.read().get(task_id) {
            Some(callbacks) => callbacks.clone(),
            None => return,
        };

        for callback in callbacks {
            let value = result.clone();
            let run = AssertUnwindSafe(async move { callback(value).await }).catch_unwind();
            match run.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Task callback failed for '{}': {:#}", task_id, e),
                Err(_) => error!("Task callback panicked for '{}'", task_id),
            }
        }
    }

    pub fn get_workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatusReport, WorkflowError> {
        self.workflows
            .read()
            .get(workflow_id)
            .map(Workflow::status_report)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))
    }

    /// Status reports for every workflow, ordered by id.
    pub fn list_workflows(&self) -> Vec<WorkflowStatusReport> {
        self.workflows
            .read()
            .values()
            .map(Workflow::status_report)
            .collect()
    }

    /// Signal a running workflow to stop. In-flight tasks observe the
    /// signal and fail; tasks not yet dispatched are marked failed. Returns
    /// false when the workflow is not running.
    pub fn cancel_workflow(&self, workflow_id: &str) -> bool {
        match self.running.get(workflow_id) {
            Some(switch) => {
                switch.cancel();
                info!("Cancellation requested for workflow '{}'", workflow_id);
                true
            }
            None => false,
        }
    }
}

/// Settles a workflow whose `execute_workflow` future was dropped before
/// finishing: unfinished tasks fail as cancelled, the workflow fails and its
/// cancellation switch is released.
struct RunGuard<'a> {
    orchestrator: &'a Orchestrator,
    workflow_id: &'a str,
    armed: bool,
}

impl<'a> RunGuard<'a> {
    fn new(orchestrator: &'a Orchestrator, workflow_id: &'a str) -> Self {
        Self {
            orchestrator,
            workflow_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let orch = self.orchestrator;
        orch.running.remove(self.workflow_id);

        let mut workflows = orch.workflows.write();
        if let Some(workflow) = workflows.get_mut(self.workflow_id) {
            let now = Utc::now();
            for task in workflow
                .tasks
                .iter_mut()
                .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running))
            {
                task.status = TaskStatus::Failed;
                task.error = Some(
                    TaskError::Cancelled {
                        agent: task.agent_name.clone(),
                    }
                    .to_string(),
                );
                task.completed_at = Some(now);
            }
            workflow.status = TaskStatus::Failed;
            workflow.completed_at = Some(now);
        }
        warn!("Workflow '{}' abandoned before completion", self.workflow_id);
    }
}

fn kind_of(document: &Document) -> Option<&str> {
    document.get("kind").and_then(Value::as_str)
}

/// Agents that declare no capabilities are not checked.
fn check_input_kind(agent: &dyn Agent, input: &Document) -> Result<(), TaskError> {
    let capabilities = agent.capabilities();
    match kind_of(input) {
        Some(kind)
            if !capabilities.is_empty() && !capabilities.iter().any(|c| c.accepts_kind(kind)) =>
        {
            Err(TaskError::CapabilityMismatch {
                agent: agent.agent_id().to_string(),
                direction: "accept",
                kind: kind.to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn check_output_kind(agent: &dyn Agent, output: &Value) -> Result<(), TaskError> {
    let capabilities = agent.capabilities();
    match output.as_object().and_then(kind_of) {
        Some(kind)
            if !capabilities.is_empty() && !capabilities.iter().any(|c| c.produces_kind(kind)) =>
        {
            Err(TaskError::CapabilityMismatch {
                agent: agent.agent_id().to_string(),
                direction: "produce",
                kind: kind.to_string(),
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{factory, AgentContext, CapabilityDescriptor, EchoAgent};
    use crate::error::BlockReason;
    use async_trait::async_trait;
    use serde_json::json;

    /// Accepts only `"invoice"` inputs and reports whatever `emit` says.
    struct InvoiceAgent {
        context: AgentContext,
    }

    #[async_trait]
    impl Agent for InvoiceAgent {
        fn context(&self) -> &AgentContext {
            &self.context
        }

        fn capabilities(&self) -> Vec<CapabilityDescriptor> {
            vec![CapabilityDescriptor::new("parse", "Parse invoices")
                .accepts(["invoice"])
                .produces(["ledger_entry"])]
        }

        async fn execute(&self, input: Document, _cancel: CancellationSignal) -> anyhow::Result<Value> {
            Ok(json!({ "kind": input.get("emit").cloned().unwrap_or(json!("ledger_entry")) }))
        }
    }

    /// Declares no capabilities and returns its input unchanged.
    struct BareAgent {
        context: AgentContext,
    }

    #[async_trait]
    impl Agent for BareAgent {
        fn context(&self) -> &AgentContext {
            &self.context
        }

        fn capabilities(&self) -> Vec<CapabilityDescriptor> {
            Vec::new()
        }

        async fn execute(&self, input: Document, _cancel: CancellationSignal) -> anyhow::Result<Value> {
            Ok(Value::Object(input))
        }
    }

    fn orchestrator() -> Orchestrator {
        let registry = Arc::new(AgentRegistry::new());
        registry.register_agent(
            "echo",
            factory(|id, config| Ok(EchoAgent::new(id, config))),
            "Echo",
            true,
            Value::Null,
        );
        registry.register_agent(
            "invoice",
            factory(|id, config| {
                Ok(InvoiceAgent {
                    context: AgentContext::new(id, config.clone()),
                })
            }),
            "Invoices",
            true,
            Value::Null,
        );
        registry.register_agent(
            "bare",
            factory(|id, config| {
                Ok(BareAgent {
                    context: AgentContext::new(id, config.clone()),
                })
            }),
            "No declared capabilities",
            true,
            Value::Null,
        );
        registry.register_agent(
            "off",
            factory(|id, config| Ok(EchoAgent::new(id, config))),
            "Disabled echo",
            false,
            Value::Null,
        );
        Orchestrator::new(registry, MemoryManager::in_memory(), OrchestratorConfig::default())
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn single_task_envelopes() {
        let orch = orchestrator();

        let ok = orch.execute_single_task("echo", doc(json!({"a": 1}))).await;
        assert!(ok.success);
        assert_eq!(ok.result, Some(json!({"a": 1})));
        assert_eq!(
            orch.registry().get_agent("echo").unwrap().status(),
            AgentStatus::Idle
        );

        let missing = orch.execute_single_task("unknown", Document::new()).await;
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("unknown"));

        let disabled = orch.execute_single_task("off", Document::new()).await;
        assert!(!disabled.success);
    }

    #[tokio::test]
    async fn capability_kinds_are_enforced() {
        let orch = orchestrator();

        let wrong_input = orch
            .execute_single_task("invoice", doc(json!({"kind": "receipt"})))
            .await;
        assert!(!wrong_input.success);
        assert!(wrong_input.error.unwrap().contains("accept"));

        let wrong_output = orch
            .execute_single_task("invoice", doc(json!({"kind": "invoice", "emit": "poem"})))
            .await;
        assert!(!wrong_output.success);
        assert_eq!(
            orch.registry().get_agent("invoice").unwrap().status(),
            AgentStatus::Error
        );

        let fine = orch
            .execute_single_task("invoice", doc(json!({"kind": "invoice"})))
            .await;
        assert!(fine.success);

        let undeclared = orch
            .execute_single_task("bare", doc(json!({"kind": "anything"})))
            .await;
        assert!(undeclared.success);
        assert_eq!(undeclared.result, Some(json!({"kind": "anything"})));
    }

    #[tokio::test]
    async fn add_task_validation() {
        let orch = orchestrator();
        orch.create_workflow("w", "W", "").unwrap();
        assert_eq!(
            orch.create_workflow("w", "again", ""),
            Err(WorkflowError::AlreadyExists("w".into()))
        );

        assert_eq!(
            orch.add_task_to_workflow("w", "t1", "ghost", Document::new(), vec![]),
            Err(WorkflowError::Agent(AgentError::NotFound("ghost".into())))
        );
        assert_eq!(
            orch.add_task_to_workflow("w", "t1", "off", Document::new(), vec![]),
            Err(WorkflowError::Agent(AgentError::Disabled("off".into())))
        );
        assert_eq!(
            orch.add_task_to_workflow("nope", "t1", "echo", Document::new(), vec![]),
            Err(WorkflowError::NotFound("nope".into()))
        );
        assert_eq!(
            orch.add_task_to_workflow("w", "t1", "echo", Document::new(), vec!["t1".into()]),
            Err(WorkflowError::SelfDependency("t1".into()))
        );

        orch.add_task_to_workflow("w", "t1", "echo", Document::new(), vec![])
            .unwrap();
        assert!(matches!(
            orch.add_task_to_workflow("w", "t1", "echo", Document::new(), vec![]),
            Err(WorkflowError::DuplicateTask { .. })
        ));
        // Registration check must not instantiate.
        assert!(!orch.registry().list_agents().iter().any(|a| a.instantiated));
    }

    #[tokio::test]
    async fn previous_results_reach_dependents() {
        let orch = orchestrator();
        orch.create_workflow("w", "W", "").unwrap();
        orch.add_task_to_workflow("w", "t1", "echo", doc(json!({"n": 1})), vec![])
            .unwrap();
        orch.add_task_to_workflow("w", "t2", "echo", Document::new(), vec!["t1".into()])
            .unwrap();

        let summary = orch.execute_workflow("w").await.unwrap();
        assert!(summary.success);
        assert_eq!(
            summary.task_results["t2"][PREVIOUS_RESULTS_KEY]["t1"]["n"],
            json!(1)
        );
        assert_eq!(summary.task_results["t1"][PREVIOUS_RESULTS_KEY], json!({}));
    }

    #[tokio::test]
    async fn unknown_dependency_rejected_before_dispatch() {
        let orch = orchestrator();
        orch.create_workflow("w", "W", "").unwrap();
        orch.add_task_to_workflow("w", "t1", "echo", Document::new(), vec!["later".into()])
            .unwrap();

        assert_eq!(
            orch.execute_workflow("w").await,
            Err(WorkflowError::UnknownDependency {
                task: "t1".into(),
                dependency: "later".into()
            })
        );
        // Still pending, so the missing task can be supplied.
        orch.add_task_to_workflow("w", "later", "echo", Document::new(), vec![])
            .unwrap();
        let summary = orch.execute_workflow("w").await.unwrap();
        assert_eq!(summary.successful_tasks, 2);
    }

    #[tokio::test]
    async fn second_execution_is_rejected() {
        let orch = orchestrator();
        orch.create_workflow("w", "W", "").unwrap();
        orch.add_task_to_workflow("w", "t1", "echo", Document::new(), vec![])
            .unwrap();
        orch.execute_workflow("w").await.unwrap();

        assert!(matches!(
            orch.execute_workflow("w").await,
            Err(WorkflowError::AlreadyExecuted { .. })
        ));
        assert_eq!(
            orch.add_task_to_workflow("w", "t2", "echo", Document::new(), vec![]),
            Err(WorkflowError::Frozen("w".into()))
        );
    }

    #[tokio::test]
    async fn cycle_blocks_without_running_anything() {
        let orch = orchestrator();
        orch.create_workflow("w", "W", "").unwrap();
        orch.add_task_to_workflow("w", "a", "echo", Document::new(), vec!["b".into()])
            .unwrap();
        orch.add_task_to_workflow("w", "b", "echo", Document::new(), vec!["a".into()])
            .unwrap();

        let err = orch.execute_workflow("w").await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Blocked {
                reason: BlockReason::Cycle { .. },
                ..
            }
        ));
        let report = orch.get_workflow_status("w").unwrap();
        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.task_summary["pending"], 2);
        assert!(orch.registry().get_agent("echo").unwrap().status() == AgentStatus::Initialized);
    }

    fn explode(_: Value) -> anyhow::Result<()> {
        panic!("callback exploded")
    }

    #[tokio::test]
    async fn callbacks_run_in_order_and_failures_are_isolated() {
        let orch = orchestrator();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let log = order.clone();
        orch.register_task_callback("t1", move |_| {
            log.lock().push("error");
            async { Err::<(), _>(anyhow::anyhow!("callback broke")) }
        });
        let log = order.clone();
        orch.register_task_callback("t1", move |result| {
            log.lock().push("panic");
            async move { explode(result) }
        });
        let log = order.clone();
        orch.register_task_callback("t1", move |result| {
            let log = log.clone();
            async move {
                assert_eq!(result["x"], json!(true));
                log.lock().push("ok");
                Ok::<(), anyhow::Error>(())
            }
        });

        orch.create_workflow("w", "W", "").unwrap();
        orch.add_task_to_workflow("w", "t1", "echo", doc(json!({"x": true})), vec![])
            .unwrap();
        let summary = orch.execute_workflow("w").await.unwrap();

        assert!(summary.success);
        assert_eq!(*order.lock(), vec!["error", "panic", "ok"]);
        assert_eq!(
            orch.get_workflow_status("w").unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn cancel_unknown_workflow_is_false() {
        let orch = orchestrator();
        assert!(!orch.cancel_workflow("nope"));
        assert!(orch.list_workflows().is_empty());
        assert!(matches!(
            orch.get_workflow_status("nope"),
            Err(WorkflowError::NotFound(_))
        ));
    }
}
