//! Arable agents - multi-agent task orchestration.
//!
//! Pluggable agents are registered by name, composed into dependency-ordered
//! workflows, and executed wave by wave, with results shared through a
//! persistent cross-agent memory.

pub mod agent;
pub mod cancel;
pub mod cli;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod registry;
pub mod runtime;
pub mod settings;
pub mod telemetry;
pub mod workflow;
pub mod workflow_file;

pub use agent::{Agent, AgentContext, AgentStatus, CapabilityDescriptor, Document};
pub use cancel::{CancellationSignal, CancellationSwitch};
pub use discovery::AgentCatalog;
pub use error::{AgentError, BlockReason, TaskError, WorkflowError};
pub use memory::MemoryManager;
pub use orchestrator::Orchestrator;
pub use registry::AgentRegistry;
