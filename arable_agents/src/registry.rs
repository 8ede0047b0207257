//! Agent registry: name -> (factory, enablement, config), plus a cache of
//! live instances. One instance per registered name at any time.

use crate::{
    agent::{Agent, AgentFactory, AgentStatus, CapabilityDescriptor},
    discovery::AgentSource,
    error::AgentError,
};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// How to build one named agent.
#[derive(Clone)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub factory: AgentFactory,
    pub description: String,
    pub enabled: bool,
    pub config: Value,
}

impl AgentRegistration {
    pub fn new(agent_id: impl Into<String>, factory: AgentFactory) -> Self {
        Self {
            agent_id: agent_id.into(),
            factory,
            description: String::new(),
            enabled: true,
            config: Value::Object(Default::default()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Snapshot row returned by [`AgentRegistry::list_agents`].
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub instantiated: bool,
    pub status: Option<AgentStatus>,
    pub capabilities: Option<Vec<CapabilityDescriptor>>,
}

#[derive(Default)]
pub struct AgentRegistry {
    registrations: RwLock<BTreeMap<String, AgentRegistration>>,
    instances: DashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite by name. Does not instantiate, and leaves any
    /// cached instance in place.
    pub fn register(&self, registration: AgentRegistration) {
        let name = registration.agent_id.clone();
        self.registrations.write().insert(name.clone(), registration);
        info!("Registered agent: {}", name);
    }

    pub fn register_agent(
        &self,
        name: &str,
        factory: AgentFactory,
        description: &str,
        enabled: bool,
        config: Value,
    ) {
        self.register(
            AgentRegistration::new(name, factory)
                .with_description(description)
                .with_enabled(enabled)
                .with_config(config),
        );
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registrations.read().contains_key(name)
    }

    /// `Some(enabled)` for registered names.
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.registrations.read().get(name).map(|r| r.enabled)
    }

    pub fn names(&self) -> Vec<String> {
        self.registrations.read().keys().cloned().collect()
    }

    /// Resolve a live instance, constructing and caching it on first use.
    /// Factories must not call back into the registry.
    #[instrument(skip(self))]
    pub fn get_agent(&self, name: &str) -> Result<Arc<dyn Agent>, AgentError> {
        let (factory, enabled, config) = {
            let registrations = self.registrations.read();
            match registrations.get(name) {
                Some(r) => (r.factory.clone(), r.enabled, r.config.clone()),
                None => {
                    error!("Agent '{}' not registered", name);
                    return Err(AgentError::NotFound(name.to_string()));
                }
            }
        };

        match self.instances.entry(name.to_string()) {
            Entry::Occupied(cached) => Ok(cached.get().clone()),
            Entry::Vacant(slot) => {
                if !enabled {
                    warn!("Agent '{}' is disabled", name);
                    return Err(AgentError::Disabled(name.to_string()));
                }

                let built = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    factory(name, &config)
                }));

                match built {
                    Ok(Ok(agent)) => {
                        slot.insert(agent.clone());
                        info!("Created agent instance: {}", name);
                        Ok(agent)
                    }
                    Ok(Err(e)) => {
                        error!("Failed to create agent '{}': {}", name, e);
                        Err(AgentError::Instantiation {
                            name: name.to_string(),
                            reason: e.to_string(),
                        })
                    }
                    Err(_) => {
                        error!("Agent factory for '{}' panicked", name);
                        Err(AgentError::Instantiation {
                            name: name.to_string(),
                            reason: "factory panicked".to_string(),
                        })
                    }
                }
            }
        }
    }

    pub fn list_agents(&self) -> Vec<AgentInfo> {
        self.registrations
            .read()
            .values()
            .map(|registration| {
                let instance = self
                    .instances
                    .get(&registration.agent_id)
                    .map(|a| a.value().clone());
                AgentInfo {
                    name: registration.agent_id.clone(),
                    description: registration.description.clone(),
                    enabled: registration.enabled,
                    instantiated: instance.is_some(),
                    status: instance.as_ref().map(|a| a.status()),
                    capabilities: instance.as_ref().map(|a| a.capabilities()),
                }
            })
            .collect()
    }

    /// Mark the cached instance `shutting_down` and evict it. The
    /// registration survives; the next `get_agent` builds a fresh instance.
    pub fn shutdown_agent(&self, name: &str) -> bool {
        match self.instances.remove(name) {
            Some((_, agent)) => {
                if let Err(e) = agent.context().set_status(AgentStatus::ShuttingDown) {
                    warn!("Shutdown of '{}' skipped status change: {}", name, e);
                }
                info!("Shutdown agent: {}", name);
                true
            }
            None => false,
        }
    }

    /// Shut down every cached instance; returns how many were evicted.
    pub fn shutdown_all(&self) -> usize {
        let names: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        names.iter().filter(|n| self.shutdown_agent(n)).count()
    }

    /// Register everything a source yields. Failures are logged and skipped.
    pub fn auto_discover(&self, source: &dyn AgentSource) -> usize {
        let location = source.location();
        let mut discovered = 0;
        for found in source.discover() {
            match found {
                Ok(agent) => {
                    self.register(
                        AgentRegistration::new(agent.name, agent.factory)
                            .with_description(agent.description)
                            .with_enabled(agent.enabled)
                            .with_config(agent.config),
                    );
                    discovered += 1;
                }
                Err(e) => error!("Failed to discover agent in {}: {:#}", location, e),
            }
        }
        info!("Auto-discovered {} agents from {}", discovered, location);
        discovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{factory, EchoAgent};
    use crate::discovery::{AgentCatalog, CatalogSource};
    use serde_json::json;

    fn echo_factory() -> AgentFactory {
        factory(|id, config| Ok(EchoAgent::new(id, config)))
    }

    #[test]
    fn unknown_agent_is_not_found() {
        let registry = AgentRegistry::new();
        let err = registry.get_agent("unknown").err().unwrap();
        assert_eq!(err, AgentError::NotFound("unknown".into()));
    }

    #[test]
    fn instances_are_cached_per_name() {
        let registry = AgentRegistry::new();
        registry.register_agent("echo", echo_factory(), "", true, json!({}));
        let a = registry.get_agent("echo").unwrap();
        let b = registry.get_agent("echo").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn disabled_agent_is_refused() {
        let registry = AgentRegistry::new();
        registry.register_agent("echo", echo_factory(), "", false, json!({}));
        assert_eq!(
            registry.get_agent("echo").err(),
            Some(AgentError::Disabled("echo".into()))
        );
        assert_eq!(registry.is_enabled("echo"), Some(false));
    }

    #[test]
    fn factory_failure_and_panic_are_contained() {
        let registry = AgentRegistry::new();
        let failing: AgentFactory =
            Arc::new(|_: &str, _: &Value| -> anyhow::Result<Arc<dyn Agent>> {
                Err(anyhow::anyhow!("no credentials"))
            });
        let panicking: AgentFactory =
            Arc::new(|_: &str, _: &Value| -> anyhow::Result<Arc<dyn Agent>> { panic!("boom") });
        registry.register(AgentRegistration::new("failing", failing));
        registry.register(AgentRegistration::new("panicking", panicking));

        match registry.get_agent("failing") {
            Err(AgentError::Instantiation { reason, .. }) => {
                assert!(reason.contains("no credentials"))
            }
            other => panic!("unexpected: {:?}", other.map(|a| a.agent_id().to_string())),
        }
        assert!(matches!(
            registry.get_agent("panicking"),
            Err(AgentError::Instantiation { .. })
        ));
        assert!(!registry.list_agents().iter().any(|a| a.instantiated));
    }

    #[test]
    fn shutdown_evicts_but_keeps_registration() {
        let registry = AgentRegistry::new();
        registry.register_agent("echo", echo_factory(), "", true, json!({}));
        let first = registry.get_agent("echo").unwrap();
        first.context().update_memory("k", json!(1));

        assert!(registry.shutdown_agent("echo"));
        assert_eq!(first.status(), AgentStatus::ShuttingDown);
        assert!(!registry.shutdown_agent("echo"));

        let second = registry.get_agent("echo").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.status(), AgentStatus::Initialized);
        assert_eq!(second.context().get_memory("k"), None);
    }

    #[test]
    fn list_agents_reports_instantiation() {
        let registry = AgentRegistry::new();
        registry.register_agent("a", echo_factory(), "first", true, json!({}));
        registry.register_agent("b", echo_factory(), "second", true, json!({}));
        registry.get_agent("b").unwrap();

        let listed = registry.list_agents();
        assert_eq!(listed.len(), 2);
        assert!(!listed[0].instantiated);
        assert!(listed[0].capabilities.is_none());
        assert!(listed[1].instantiated);
        assert_eq!(listed[1].status, Some(AgentStatus::Initialized));
        assert_eq!(listed[1].capabilities.as_ref().unwrap()[0].name, "echo");
    }

    #[test]
    fn auto_discover_registers_catalog_entries() {
        let registry = AgentRegistry::new();
        let catalog = AgentCatalog::builtin();
        assert_eq!(registry.auto_discover(&CatalogSource::new(&catalog)), 1);
        assert!(registry.is_registered("echo"));
    }
}
