use crate::{cancel::CancellationSignal, error::AgentError};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Open task-input / result document.
pub type Document = Map<String, Value>;

/// Kind accepted or produced by an agent that matches anything.
pub const ANY_KIND: &str = "*";

/// Agent contract. Implementations must not touch shared state other than
/// their own [`AgentContext`], and report failure through `Err` instead of
/// panicking.
#[async_trait]
pub trait Agent: Send + Sync {
    fn context(&self) -> &AgentContext;

    fn capabilities(&self) -> Vec<CapabilityDescriptor>;

    async fn execute(&self, input: Document, cancel: CancellationSignal) -> Result<Value>;

    fn agent_id(&self) -> &str {
        self.context().agent_id()
    }

    fn status(&self) -> AgentStatus {
        self.context().status()
    }
}

/// Static description of one thing an agent can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input_kinds: Vec<String>,
    #[serde(default)]
    pub output_kinds: Vec<String>,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_kinds: Vec::new(),
            output_kinds: Vec::new(),
        }
    }

    pub fn accepts<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn produces<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn accepts_kind(&self, kind: &str) -> bool {
        self.input_kinds.iter().any(|k| k == kind || k == ANY_KIND)
    }

    pub fn produces_kind(&self, kind: &str) -> bool {
        self.output_kinds.iter().any(|k| k == kind || k == ANY_KIND)
    }
}

/// Lifecycle of a cached agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initialized,
    Running,
    Idle,
    Error,
    ShuttingDown,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Initialized => "initialized",
            AgentStatus::Running => "running",
            AgentStatus::Idle => "idle",
            AgentStatus::Error => "error",
            AgentStatus::ShuttingDown => "shutting_down",
        }
    }

    /// `initialized -> running -> {idle | error} -> running ...`, with
    /// `shutting_down` reachable from anywhere and terminal. Re-entering the
    /// current status is allowed.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        if self == next {
            return self != ShuttingDown;
        }
        matches!(
            (self, next),
            (Initialized, Running)
                | (Running, Idle)
                | (Running, Error)
                | (Idle, Running)
                | (Error, Running)
                | (Initialized | Running | Idle | Error, ShuttingDown)
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an agent's private state.
#[derive(Debug, Clone, Serialize)]
pub struct AgentState {
    pub agent_id: String,
    pub status: AgentStatus,
    pub memory: HashMap<String, Value>,
    pub last_action: Option<String>,
    pub metrics: HashMap<String, f64>,
}

/// Identity, config and mutable state owned by one agent instance.
#[derive(Debug)]
pub struct AgentContext {
    agent_id: String,
    config: Value,
    state: RwLock<AgentState>,
}

impl AgentContext {
    pub fn new(agent_id: impl Into<String>, config: Value) -> Self {
        let agent_id = agent_id.into();
        Self {
            state: RwLock::new(AgentState {
                agent_id: agent_id.clone(),
                status: AgentStatus::Initialized,
                memory: HashMap::new(),
                last_action: None,
                metrics: HashMap::new(),
            }),
            agent_id,
            config,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn status(&self) -> AgentStatus {
        self.state.read().status
    }

    pub fn set_status(&self, next: AgentStatus) -> Result<(), AgentError> {
        let mut state = self.state.write();
        let current = state.status;
        if !current.can_transition_to(next) {
            warn!(
                "Agent {} refused status change {} -> {}",
                self.agent_id, current, next
            );
            return Err(AgentError::InvalidTransition {
                agent: self.agent_id.clone(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        state.status = next;
        drop(state);
        info!("Agent {} status: {}", self.agent_id, next);
        Ok(())
    }

    /// Scratchpad write; in-process only.
    pub fn update_memory(&self, key: impl Into<String>, value: Value) {
        self.state.write().memory.insert(key.into(), value);
    }

    pub fn get_memory(&self, key: &str) -> Option<Value> {
        self.state.read().memory.get(key).cloned()
    }

    pub fn record_action(&self, action: impl Into<String>) {
        self.state.write().last_action = Some(action.into());
    }

    pub fn increment_metric(&self, name: &str, delta: f64) {
        *self
            .state
            .write()
            .metrics
            .entry(name.to_string())
            .or_insert(0.0) += delta;
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.state.read().metrics.get(name).copied()
    }

    pub fn snapshot(&self) -> AgentState {
        self.state.read().clone()
    }
}

/// Builds an agent instance from `(agent_id, config)`.
pub type AgentFactory = Arc<dyn Fn(&str, &Value) -> Result<Arc<dyn Agent>> + Send + Sync>;

/// Wrap a constructor closure as an [`AgentFactory`].
pub fn factory<A, F>(build: F) -> AgentFactory
where
    A: Agent + 'static,
    F: Fn(&str, &Value) -> Result<A> + Send + Sync + 'static,
{
    Arc::new(move |id: &str, config: &Value| {
        let agent: Arc<dyn Agent> = Arc::new(build(id, config)?);
        Ok(agent)
    })
}

// --- Built-in Agents ---

/// Returns its input unchanged. Honors an optional `delay_ms` field,
/// aborting early when cancelled.
pub struct EchoAgent {
    context: AgentContext,
}

impl EchoAgent {
    pub fn new(agent_id: &str, config: &Value) -> Self {
        Self {
            context: AgentContext::new(agent_id, config.clone()),
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn context(&self) -> &AgentContext {
        &self.context
    }

    fn capabilities(&self) -> Vec<CapabilityDescriptor> {
        vec![CapabilityDescriptor::new("echo", "Return the task input unchanged")
            .accepts([ANY_KIND])
            .produces([ANY_KIND])]
    }

    async fn execute(&self, input: Document, cancel: CancellationSignal) -> Result<Value> {
        self.context.increment_metric("requests", 1.0);

        if let Some(delay) = input.get("delay_ms").and_then(Value::as_u64) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = cancel.cancelled() => {
                    anyhow::bail!("echo cancelled while waiting {}ms", delay);
                }
            }
        }

        self.context.record_action("echo");
        self.context
            .update_memory("last_input", Value::Object(input.clone()));
        info!("Echo agent processed request");
        Ok(Value::Object(input))
    }
}
