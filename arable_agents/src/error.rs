//! Error taxonomy for agent resolution, task execution, workflows and memory.

use serde::Serialize;
use thiserror::Error;

/// Errors raised while resolving or driving an agent instance.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent '{0}' is not registered")]
    NotFound(String),

    #[error("Agent '{0}' is disabled")]
    Disabled(String),

    #[error("Failed to instantiate agent '{name}': {reason}")]
    Instantiation { name: String, reason: String },

    #[error("Invalid status transition for agent '{agent}' from {from} to {to}")]
    InvalidTransition {
        agent: String,
        from: String,
        to: String,
    },
}

/// Failure of a single task execution. Never escapes the orchestrator's
/// fault boundary; it is rendered into a result envelope or task record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Agent '{agent}' execution failed: {message}")]
    Execution { agent: String, message: String },

    #[error("Agent '{agent}' execution timed out after {seconds}s")]
    Timeout { agent: String, seconds: u64 },

    #[error("Agent '{agent}' execution was cancelled")]
    Cancelled { agent: String },

    #[error("Agent '{agent}' panicked during execution")]
    Panicked { agent: String },

    #[error("Agent '{agent}' does not {direction} kind '{kind}'")]
    CapabilityMismatch {
        agent: String,
        direction: &'static str,
        kind: String,
    },
}

/// Why a workflow stopped making progress with pending tasks left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// Pending tasks wait on each other; no failure upstream.
    Cycle { tasks: Vec<String> },
    /// Pending tasks (transitively) depend on tasks that failed.
    UpstreamFailed {
        tasks: Vec<String>,
        failed: Vec<String>,
    },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Cycle { tasks } => {
                write!(f, "circular dependencies between [{}]", tasks.join(", "))
            }
            BlockReason::UpstreamFailed { tasks, failed } => write!(
                f,
                "tasks [{}] depend on failed tasks [{}]",
                tasks.join(", "),
                failed.join(", ")
            ),
        }
    }
}

/// Workflow-level errors. Only `Blocked` and internal faults are raised
/// from `execute_workflow`; the rest are construction-time rejections.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Workflow '{0}' not found")]
    NotFound(String),

    #[error("Workflow '{0}' already exists")]
    AlreadyExists(String),

    #[error("Workflow '{workflow}' blocked: {reason}")]
    Blocked {
        workflow: String,
        reason: BlockReason,
    },

    #[error("Workflow '{workflow}' has already been executed (status: {status})")]
    AlreadyExecuted { workflow: String, status: String },

    #[error("Workflow '{0}' is no longer pending; its task list is frozen")]
    Frozen(String),

    #[error("Task '{task}' already exists in workflow '{workflow}'")]
    DuplicateTask { workflow: String, task: String },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Task input must be a JSON object, got {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Errors surfaced by memory backends' internal plumbing. Backends convert
/// these into `false` returns on `store`/`delete`.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Memory I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Embedded store failure: {0}")]
    Store(#[from] sled::Error),

    #[error("Invalid owner id '{0}'")]
    InvalidOwner(String),
}

pub type MemoryResult<T> = Result<T, MemoryError>;
