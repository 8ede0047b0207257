// plugins/uppercase_agent/src/lib.rs
//! A minimal agent that turns text (or a list of texts) into UPPER-CASE.
//!
//! ### Supported task inputs
//! ```jsonc
//! { "action": "uppercase", "text": "hello" }
//! { "action": "uppercase_many", "texts": ["foo", "bar"] }
//! ```
//!
//! Link this crate and call [`register`] on the catalog the registry is
//! discovered from; the agent is then known as `uppercase`.

use arable_agents::agent::{factory, Agent, AgentContext, CapabilityDescriptor, Document};
use arable_agents::cancel::CancellationSignal;
use arable_agents::discovery::AgentCatalog;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

pub const TYPE_NAME: &str = "UppercaseAgent";

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "action")]
enum Request {
    Uppercase { text: String },
    UppercaseMany { texts: Vec<String> },
}

pub struct UppercaseAgent {
    context: AgentContext,
}

impl UppercaseAgent {
    pub fn new(agent_id: &str, config: &Value) -> Self {
        Self {
            context: AgentContext::new(agent_id, config.clone()),
        }
    }

    fn process(&self, req: Request) -> String {
        match req {
            Request::Uppercase { text } => text.to_uppercase(),
            Request::UppercaseMany { texts } => texts
                .into_iter()
                .map(|s| s.to_uppercase())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[async_trait]
impl Agent for UppercaseAgent {
    fn context(&self) -> &AgentContext {
        &self.context
    }

    fn capabilities(&self) -> Vec<CapabilityDescriptor> {
        vec![CapabilityDescriptor::new("uppercase", "Upper-case one or more texts")
            .accepts(["text"])
            .produces(["text"])]
    }

    async fn execute(&self, input: Document, _cancel: CancellationSignal) -> Result<Value> {
        // Structured request, or a bare `text` field
        let request = match serde_json::from_value::<Request>(Value::Object(input.clone())) {
            Ok(req) => req,
            Err(_) => match input.get("text").and_then(Value::as_str) {
                Some(text) => Request::Uppercase {
                    text: text.to_string(),
                },
                None => {
                    return Err(anyhow!(
                        "Invalid input format. Expected an 'action' field or a 'text' string"
                    ))
                }
            },
        };

        let result = self.process(request);
        self.context.record_action("uppercase");
        self.context.increment_metric("characters", result.len() as f64);
        info!("Processed uppercase request, output length: {}", result.len());
        Ok(json!({ "kind": "text", "text": result }))
    }
}

/// Add [`UppercaseAgent`] to `catalog`.
pub fn register(catalog: &mut AgentCatalog) {
    catalog.register(
        TYPE_NAME,
        "Upper-cases text",
        factory(|id, config| Ok(UppercaseAgent::new(id, config))),
    );
    info!("Uppercase agent registered in catalog");
}
