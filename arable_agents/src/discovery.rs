//! Startup-time agent discovery.
//!
//! Implementations are known at compile time through an [`AgentCatalog`]
//! (type name -> factory). An [`AgentSource`] decides which catalog entries
//! get registered and under what name:
//!
//! * [`CatalogSource`] registers every catalog entry under its derived name.
//! * [`ManifestDirSource`] scans a directory of `*.toml` manifests, each
//!   naming a catalog type plus description, enablement and config.
//!
//! Each discovered item is independent; a broken manifest does not stop the
//! rest of the scan.

use crate::agent::{factory, AgentFactory, EchoAgent};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A compile-time known agent implementation.
#[derive(Clone)]
pub struct CatalogEntry {
    pub type_name: String,
    pub description: String,
    pub factory: AgentFactory,
}

/// Registration table of agent implementations keyed by type name.
#[derive(Clone, Default)]
pub struct AgentCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of the agents shipped with this crate.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(
            "EchoAgent",
            "Returns its input unchanged",
            factory(|id, config| Ok(EchoAgent::new(id, config))),
        );
        catalog
    }

    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        description: impl Into<String>,
        factory: AgentFactory,
    ) -> &mut Self {
        let type_name = type_name.into();
        self.entries.insert(
            type_name.clone(),
            CatalogEntry {
                type_name,
                description: description.into(),
                factory,
            },
        );
        self
    }

    pub fn get(&self, type_name: &str) -> Option<&CatalogEntry> {
        self.entries.get(type_name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One agent found by a source, ready to be registered.
#[derive(Clone)]
pub struct DiscoveredAgent {
    pub name: String,
    pub description: String,
    pub factory: AgentFactory,
    pub enabled: bool,
    pub config: Value,
}

/// Something the registry can auto-discover agents from.
pub trait AgentSource {
    /// Human-readable origin used in logs.
    fn location(&self) -> String;

    /// Every discovery attempt, successful or not.
    fn discover(&self) -> Vec<Result<DiscoveredAgent>>;
}

/// `DocumentExtractorAgent` -> `documentextractor`.
pub fn derive_agent_name(type_name: &str) -> String {
    type_name.to_lowercase().replace("agent", "")
}

/// Registers every entry of a catalog under its derived name.
pub struct CatalogSource<'a> {
    catalog: &'a AgentCatalog,
}

impl<'a> CatalogSource<'a> {
    pub fn new(catalog: &'a AgentCatalog) -> Self {
        Self { catalog }
    }
}

impl AgentSource for CatalogSource<'_> {
    fn location(&self) -> String {
        "agent catalog".to_string()
    }

    fn discover(&self) -> Vec<Result<DiscoveredAgent>> {
        self.catalog
            .entries()
            .map(|entry| {
                let name = derive_agent_name(&entry.type_name);
                if name.is_empty() {
                    return Err(anyhow!(
                        "Type name '{}' yields an empty agent name",
                        entry.type_name
                    ));
                }
                Ok(DiscoveredAgent {
                    name,
                    description: format!("Auto-discovered agent from {}", entry.type_name),
                    factory: entry.factory.clone(),
                    enabled: true,
                    config: Value::Object(Default::default()),
                })
            })
            .collect()
    }
}

/// On-disk manifest describing one agent registration.
#[derive(Debug, Deserialize)]
struct AgentManifest {
    #[serde(rename = "type")]
    agent_type: String,
    name: Option<String>,
    description: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    config: Value,
}

fn default_enabled() -> bool {
    true
}

/// Scans a directory for `*.toml` agent manifests.
pub struct ManifestDirSource {
    dir: PathBuf,
    catalog: AgentCatalog,
}

impl ManifestDirSource {
    pub fn new(dir: impl Into<PathBuf>, catalog: AgentCatalog) -> Self {
        Self {
            dir: dir.into(),
            catalog,
        }
    }

    fn manifest_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read agents directory {:?}", self.dir))?
        {
            let path = entry?.path();
            let is_manifest = path.extension().and_then(|e| e.to_str()) == Some("toml");
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('_') || n.starts_with('.'))
                .unwrap_or(true);
            if is_manifest && !hidden && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn load(&self, path: &Path) -> Result<DiscoveredAgent> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {:?}", path))?;
        let manifest: AgentManifest = toml::from_str(&raw)
            .with_context(|| format!("Invalid agent manifest {:?}", path))?;

        let entry = self.catalog.get(&manifest.agent_type).ok_or_else(|| {
            anyhow!(
                "Manifest {:?} names unknown agent type '{}'",
                path,
                manifest.agent_type
            )
        })?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("manifest");

        debug!("Loaded agent manifest {:?}", path);
        Ok(DiscoveredAgent {
            name: manifest
                .name
                .unwrap_or_else(|| derive_agent_name(&entry.type_name)),
            description: manifest
                .description
                .unwrap_or_else(|| format!("Auto-discovered agent from {}", file_name)),
            factory: entry.factory.clone(),
            enabled: manifest.enabled,
            config: match manifest.config {
                Value::Null => Value::Object(Default::default()),
                other => other,
            },
        })
    }
}

impl AgentSource for ManifestDirSource {
    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    fn discover(&self) -> Vec<Result<DiscoveredAgent>> {
        if !self.dir.exists() {
            warn!("Agents directory not found: {:?}", self.dir);
            return Vec::new();
        }
        match self.manifest_paths() {
            Ok(paths) => paths.iter().map(|p| self.load(p)).collect(),
            Err(e) => vec![Err(e)],
        }
    }
}
