//! Workflow definitions loaded from TOML or JSON files.
//!
//! ```toml
//! id = "nightly"
//! name = "Nightly sync"
//!
//! [[tasks]]
//! id = "extract"
//! agent = "echo"
//! input = { sheet = "Projects" }
//!
//! [[tasks]]
//! id = "publish"
//! agent = "uppercase"
//! depends_on = ["extract"]
//! ```

use crate::{agent::Document, error::WorkflowError, orchestrator::Orchestrator};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Generated when the file does not name one.
    #[serde(default = "generated_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<TaskDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub agent: String,
    #[serde(default = "empty_input")]
    pub input: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn generated_id() -> String {
    format!("workflow_{}", Uuid::new_v4().simple())
}

fn empty_input() -> Value {
    Value::Object(Document::new())
}

impl WorkflowDefinition {
    /// Parse by extension: `.json` as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {:?}", path))?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let definition: WorkflowDefinition = if is_json {
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON workflow: {:?}", path))?
        } else {
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML workflow: {:?}", path))?
        };

        definition.validate()?;
        Ok(definition)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(anyhow!("Workflow '{}' must contain at least one task", self.id));
        }

        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            if !task_ids.insert(task.id.as_str()) {
                return Err(anyhow!("Duplicate task ID: {}", task.id));
            }
            if !task.input.is_object() {
                return Err(anyhow!("Input of task {} must be a table/object", task.id));
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if !task_ids.contains(dep.as_str()) {
                    return Err(anyhow!("Task {} depends on non-existent task: {}", task.id, dep));
                }
            }
        }

        Ok(())
    }

    /// Create the workflow and its tasks; returns the workflow id.
    pub fn apply(&self, orchestrator: &Orchestrator) -> Result<String, WorkflowError> {
        orchestrator.create_workflow(&self.id, &self.name, &self.description)?;
        for task in &self.tasks {
            let input = match &task.input {
                Value::Object(map) => map.clone(),
                other => return Err(WorkflowError::InvalidInput(other.to_string())),
            };
            orchestrator.add_task_to_workflow(
                &self.id,
                &task.id,
                &task.agent,
                input,
                task.depends_on.clone(),
            )?;
        }
        info!(
            "Loaded workflow '{}' with {} task(s)",
            self.id,
            self.tasks.len()
        );
        Ok(self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    const TOML_DEFINITION: &str = r#"
id = "nightly"
name = "Nightly sync"

[[tasks]]
id = "extract"
agent = "echo"
input = { sheet = "Projects", rows = 3 }

[[tasks]]
id = "publish"
agent = "echo"
depends_on = ["extract"]
"#;

    #[test]
    fn toml_definition_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nightly.toml");
        fs::write(&path, TOML_DEFINITION).unwrap();

        let def = WorkflowDefinition::load(&path).unwrap();
        assert_eq!(def.id, "nightly");
        assert_eq!(def.description, "");
        assert_eq!(def.tasks[0].input, json!({"sheet": "Projects", "rows": 3}));
        assert_eq!(def.tasks[1].input, json!({}));
        assert_eq!(def.tasks[1].depends_on, vec!["extract".to_string()]);
    }

    #[test]
    fn json_definition_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.json");
        let raw = json!({
            "name": "W",
            "tasks": [{"id": "t1", "agent": "echo", "input": {"a": 1}}]
        });
        fs::write(&path, raw.to_string()).unwrap();

        let def = WorkflowDefinition::load(&path).unwrap();
        assert!(def.id.starts_with("workflow_"));
        assert_eq!(def.tasks.len(), 1);
        assert!(def.tasks[0].depends_on.is_empty());
    }

    #[test]
    fn validation_errors() {
        let task = |id: &str, deps: &[&str]| TaskDefinition {
            id: id.into(),
            agent: "echo".into(),
            input: empty_input(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        };
        let mut def = WorkflowDefinition {
            id: "w".into(),
            name: "W".into(),
            description: String::new(),
            tasks: vec![],
        };
        assert!(def.validate().is_err());

        def.tasks = vec![task("a", &[]), task("a", &[])];
        assert!(def.validate().is_err());

        def.tasks = vec![task("a", &["missing"])];
        assert!(def.validate().is_err());

        def.tasks = vec![task("a", &[])];
        def.tasks[0].input = json!([1, 2]);
        assert!(def.validate().is_err());

        def.tasks[0].input = empty_input();
        assert!(def.validate().is_ok());
    }
}
