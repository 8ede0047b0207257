//! Configuration loading with file layering, environment overrides and validation.

use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

pub const MEMORY_BACKENDS: [&str; 3] = ["file", "sled", "in_memory"];
pub const LOG_FORMATS: [&str; 2] = ["text", "json"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-task execution deadline.
    pub task_timeout_seconds: u64,
    /// Hold a per-agent-name lock around `execute`. When off, overlapping
    /// runs share one cached instance and its reported status is best-effort:
    /// the first run to finish sets it idle while others are still running.
    pub serialize_agent_execution: bool,
    /// Check `"kind"` fields against declared capabilities.
    pub validate_capabilities: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_timeout_seconds: 300,
            serialize_agent_execution: true,
            validate_capabilities: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub backend: String, // "file", "sled" or "in_memory"
    pub path: PathBuf,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            path: PathBuf::from("data/memory"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory scanned for `*.toml` agent manifests.
    pub manifest_dir: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            manifest_dir: PathBuf::from("agents"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub memory: MemoryConfig,
    pub registry: RegistryConfig,
}

impl Settings {
    /// Embedded defaults, then `arable.toml` in the working directory, then
    /// `ARABLE__SECTION__KEY` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like [`Settings::load`] but with an explicit file in place of
    /// `arable.toml`; that file must exist.
    pub fn load_from(path: Option<&std::path::Path>) -> Result<Self> {
        let local = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("arable").required(false),
        };

        let config = Config::builder()
            .add_source(File::from_str(
                include_str!("../config.toml"),
                FileFormat::Toml,
            ))
            .add_source(local)
            .add_source(
                Environment::with_prefix("ARABLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.task_timeout_seconds == 0 {
            return Err(anyhow!("Task timeout cannot be 0"));
        }

        if !MEMORY_BACKENDS.contains(&self.memory.backend.as_str()) {
            return Err(anyhow!(
                "Unknown memory backend '{}' (expected one of {:?})",
                self.memory.backend,
                MEMORY_BACKENDS
            ));
        }

        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(anyhow!(
                "Unknown log format '{}' (expected one of {:?})",
                self.logging.format,
                LOG_FORMATS
            ));
        }

        if !self.registry.manifest_dir.exists() {
            warn!(
                "Agent manifest directory does not exist: {:?}",
                self.registry.manifest_dir
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn embedded_defaults_match_default_impl() {
        let settings = Settings::load_from(None).unwrap();
        assert_eq!(settings.orchestrator, OrchestratorConfig::default());
        assert_eq!(settings.memory.backend, "file");
        assert_eq!(settings.logging.format, "text");
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[orchestrator]\ntask_timeout_seconds = 5\n\n[memory]\nbackend = \"sled\""
        )
        .unwrap();

        let settings = Settings::load_from(Some(file.path())).unwrap();
        assert_eq!(settings.orchestrator.task_timeout_seconds, 5);
        assert!(settings.orchestrator.serialize_agent_execution);
        assert_eq!(settings.memory.backend, "sled");
        assert_eq!(settings.memory.path, PathBuf::from("data/memory"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.orchestrator.task_timeout_seconds = 0;
        assert!(settings.validate().is_err());

        settings = Settings::default();
        settings.memory.backend = "redis".into();
        assert!(settings.validate().is_err());

        settings = Settings::default();
        settings.logging.format = "xml".into();
        assert!(settings.validate().is_err());
    }
}
