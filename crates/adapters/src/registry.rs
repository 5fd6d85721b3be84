//! Process-wide adapter registry with by-name and by-capability resolution.

use crate::{Adapter, Capability, ConfigField};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Transport-facing summary of one adapter, including its config schema.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterSummary {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub capabilities: Vec<Capability>,
    pub config_schema: Vec<ConfigField>,
}

/// Registered adapters. Capability resolution returns the first match in
/// registration order, so resolution is deterministic.
#[derive(Default)]
pub struct AdapterRegistry {
    ordered: Vec<Arc<dyn Adapter>>,
    by_name: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        let name = adapter.name().to_string();
        if self.by_name.contains_key(&name) {
            warn!(adapter = %name, "adapter already registered, replacing");
            self.ordered.retain(|a| a.name() != name);
        }
        debug!(adapter = %name, capabilities = ?adapter.capabilities(), "registered adapter");
        self.ordered.push(Arc::clone(&adapter));
        self.by_name.insert(name, adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.by_name.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<dyn Adapter>> {
        self.ordered.clone()
    }

    /// First registered adapter declaring `capability`.
    pub fn first_with(&self, capability: Capability) -> Option<Arc<dyn Adapter>> {
        self.ordered
            .iter()
            .find(|a| a.capabilities().contains(&capability))
            .cloned()
    }

    pub fn summaries(&self) -> Vec<AdapterSummary> {
        self.ordered
            .iter()
            .map(|a| AdapterSummary {
                name: a.name().to_string(),
                display_name: a.display_name().to_string(),
                version: a.version().to_string(),
                capabilities: a.capabilities(),
                config_schema: a.config_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;

    #[test]
    fn resolution_is_deterministic() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockAdapter::named("alpha")));
        registry.register(Arc::new(MockAdapter::named("beta")));

        assert_eq!(registry.get("beta").unwrap().name(), "beta");
        assert_eq!(
            registry.first_with(Capability::UploadData).unwrap().name(),
            "alpha"
        );
        let names: Vec<_> = registry.list().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn summaries_carry_schema() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockAdapter::named("alpha")));
        let summaries = registry.summaries();
        assert_eq!(summaries.len(), 1);
        assert!(!summaries[0].config_schema.is_empty());
    }
}
