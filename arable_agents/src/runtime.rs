//! Process wiring: builds the memory backend, registry and orchestrator
//! from settings, and implements the CLI commands on top of them.

use crate::{
    agent::Document,
    discovery::{AgentCatalog, CatalogSource, ManifestDirSource},
    memory::{FileMemoryBackend, InMemoryBackend, MemoryBackend, MemoryManager, SledMemoryBackend},
    orchestrator::Orchestrator,
    registry::AgentRegistry,
    settings::{MemoryConfig, Settings},
    workflow_file::WorkflowDefinition,
};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub fn build_memory(config: &MemoryConfig) -> Result<MemoryManager> {
    let backend: Arc<dyn MemoryBackend> = match config.backend.as_str() {
        "file" => Arc::new(
            FileMemoryBackend::new(&config.path)
                .with_context(|| format!("Failed to open memory directory {:?}", config.path))?,
        ),
        "sled" => Arc::new(
            SledMemoryBackend::open(&config.path)
                .with_context(|| format!("Failed to open memory database {:?}", config.path))?,
        ),
        "in_memory" => Arc::new(InMemoryBackend::new()),
        other => return Err(anyhow!("Unknown memory backend '{}'", other)),
    };
    info!("Memory backend: {}", config.backend);
    Ok(MemoryManager::new(backend))
}

/// Register every catalog entry, then any manifests in `manifest_dir`
/// (manifests win on name clashes).
pub fn build_registry(catalog: &AgentCatalog, manifest_dir: &Path) -> AgentRegistry {
    let registry = AgentRegistry::new();
    registry.auto_discover(&CatalogSource::new(catalog));
    if manifest_dir.is_dir() {
        registry.auto_discover(&ManifestDirSource::new(manifest_dir, catalog.clone()));
    }
    registry
}

pub fn build_orchestrator(settings: &Settings, catalog: &AgentCatalog) -> Result<Orchestrator> {
    let memory = build_memory(&settings.memory)?;
    let registry = Arc::new(build_registry(catalog, &settings.registry.manifest_dir));
    Ok(Orchestrator::new(
        registry,
        memory,
        settings.orchestrator.clone(),
    ))
}

pub fn parse_input(raw: &str) -> Result<Document> {
    match serde_json::from_str::<Value>(raw).context("Task input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("Task input must be a JSON object, got {}", other),
    }
}

pub fn list_agents(orchestrator: &Orchestrator) -> Result<String> {
    Ok(serde_json::to_string_pretty(
        &orchestrator.registry().list_agents(),
    )?)
}

/// Run one task; errors only on bad input, failures come back in the envelope.
#[instrument(skip(orchestrator, raw_input))]
pub async fn run_task(orchestrator: &Orchestrator, agent: &str, raw_input: &str) -> Result<String> {
    let input = parse_input(raw_input)?;
    let envelope = orchestrator.execute_single_task(agent, input).await;
    if !envelope.success {
        warn!("Task with agent '{}' failed", agent);
    }
    Ok(serde_json::to_string_pretty(&envelope)?)
}

#[instrument(skip(orchestrator))]
pub async fn run_workflow(orchestrator: &Orchestrator, path: &Path) -> Result<String> {
    let definition = WorkflowDefinition::load(path)?;
    let workflow_id = definition
        .apply(orchestrator)
        .context("Failed to load workflow into orchestrator")?;

    let summary = orchestrator
        .execute_workflow(&workflow_id)
        .await
        .with_context(|| format!("Workflow '{}' did not complete", workflow_id))?;

    if !summary.success {
        warn!(
            "Workflow '{}' finished with {} failed task(s)",
            workflow_id, summary.failed_tasks
        );
    }
    Ok(serde_json::to_string_pretty(&summary)?)
}
