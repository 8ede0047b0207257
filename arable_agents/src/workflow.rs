//! Workflow and task records plus the pure scheduling helpers the
//! orchestrator's wave loop is built from.

use crate::{agent::Document, error::BlockReason};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflows share the task status vocabulary.
pub type WorkflowStatus = TaskStatus;

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowTask {
    pub task_id: String,
    pub agent_name: String,
    pub input: Document,
    /// Insertion-ordered, no duplicates.
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowTask {
    pub fn new(
        task_id: impl Into<String>,
        agent_name: impl Into<String>,
        input: Document,
        dependencies: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut seen = HashSet::new();
        let dependencies = dependencies
            .into_iter()
            .filter(|d| seen.insert(d.clone()))
            .collect();
        Self {
            task_id: task_id.into(),
            agent_name: agent_name.into(),
            input,
            dependencies,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_ready(&self, completed: &HashSet<String>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|d| completed.contains(d))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub name: String,
    pub description: String,
    /// Insertion order; frozen once the workflow leaves `pending`.
    pub tasks: Vec<WorkflowTask>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(
        workflow_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            name: name.into(),
            description: description.into(),
            tasks: Vec::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut WorkflowTask> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// First `(task, dependency)` pair whose dependency is not a task here.
    pub fn unknown_dependency(&self) -> Option<(String, String)> {
        let ids: HashSet<&str> = self.tasks.iter().map(|t| t.task_id.as_str()).collect();
        self.tasks.iter().find_map(|t| {
            t.dependencies
                .iter()
                .find(|d| !ids.contains(d.as_str()))
                .map(|d| (t.task_id.clone(), d.clone()))
        })
    }

    /// Ids of pending tasks whose dependencies are all completed, in
    /// insertion order.
    pub fn ready_tasks(&self, completed: &HashSet<String>) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.is_ready(completed))
            .map(|t| t.task_id.clone())
            .collect()
    }

    /// Explain why pending tasks can never become ready.
    pub fn classify_block(&self) -> BlockReason {
        let failed: HashSet<&str> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.task_id.as_str())
            .collect();
        let by_id: HashMap<&str, &WorkflowTask> =
            self.tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();

        let pending: Vec<&WorkflowTask> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();

        let mut tainted = Vec::new();
        let mut culprits: Vec<String> = Vec::new();
        for task in &pending {
            let hits = failed_ancestors(task, &by_id, &failed);
            if !hits.is_empty() {
                tainted.push(task.task_id.clone());
                for hit in hits {
                    if !culprits.contains(&hit) {
                        culprits.push(hit);
                    }
                }
            }
        }

        if tainted.is_empty() {
            BlockReason::Cycle {
                tasks: pending.iter().map(|t| t.task_id.clone()).collect(),
            }
        } else {
            BlockReason::UpstreamFailed {
                tasks: tainted,
                failed: culprits,
            }
        }
    }

    pub fn status_report(&self) -> WorkflowStatusReport {
        let task_summary = TaskStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), self.count(*s)))
            .collect();
        WorkflowStatusReport {
            workflow_id: self.workflow_id.clone(),
            name: self.name.clone(),
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            total_tasks: self.tasks.len(),
            task_summary,
            tasks: self
                .tasks
                .iter()
                .map(|t| TaskSummary {
                    task_id: t.task_id.clone(),
                    agent_name: t.agent_name.clone(),
                    status: t.status,
                    dependencies: t.dependencies.clone(),
                    error: t.error.clone(),
                })
                .collect(),
        }
    }
}

/// Failed tasks reachable through `task`'s dependency edges.
fn failed_ancestors(
    task: &WorkflowTask,
    by_id: &HashMap<&str, &WorkflowTask>,
    failed: &HashSet<&str>,
) -> Vec<String> {
    let mut hits = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<&str> = task.dependencies.iter().map(String::as_str).collect();
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        if failed.contains(id) {
            hits.push(id.to_string());
            continue;
        }
        if let Some(dep) = by_id.get(id) {
            stack.extend(dep.dependencies.iter().map(String::as_str));
        }
    }
    hits.sort();
    hits
}

/// Outcome of `execute_single_task`; never an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEnvelope {
    pub success: bool,
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn success(agent: &str, result: Value) -> Self {
        Self {
            success: true,
            agent: agent.to_string(),
            result: Some(result),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(agent: &str, error: impl ToString) -> Self {
        Self {
            success: false,
            agent: agent.to_string(),
            result: None,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// Returned by a workflow run that reached the end of its wave loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub success: bool,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub task_results: BTreeMap<String, Value>,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub agent_name: String,
    pub status: TaskStatus,
    pub dependencies: Vec<String>,
    pub error: Option<String>,
}

/// Read-only snapshot; `task_summary` counts always sum to `total_tasks`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tasks: usize,
    pub task_summary: BTreeMap<String, usize>,
    pub tasks: Vec<TaskSummary>,
}
