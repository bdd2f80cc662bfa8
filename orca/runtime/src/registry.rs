use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use serde_json::json;
use shared_audit::{AuditSink, NullAuditSink};

use crate::{
    error::ConfigError,
    module::{Module, ModuleSpec},
};

/// Builds a module instance from its validated spec.
pub type ModuleFactory =
    Arc<dyn Fn(ModuleSpec) -> Result<Box<dyn Module>, ConfigError> + Send + Sync>;

/// Explicit mapping from type tag to factory, populated at startup.
pub struct ModuleRegistry {
    factories: IndexMap<String, ModuleFactory>,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NullAuditSink))
    }
}

impl ModuleRegistry {
    /// Creates an empty registry reporting registrations to `audit`.
    #[must_use]
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            factories: IndexMap::new(),
            audit,
        }
    }

    /// Registers `factory` under `type_tag`, replacing any previous entry.
    pub fn register<F>(&mut self, type_tag: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(ModuleSpec) -> Result<Box<dyn Module>, ConfigError> + Send + Sync + 'static,
    {
        let type_tag = type_tag.into();
        self.audit
            .record("module_loaded", json!({ "type": type_tag }));
        self.factories.insert(type_tag, Arc::new(factory));
        self
    }

    /// Whether a factory exists for `type_tag`.
    #[must_use]
    pub fn contains(&self, type_tag: &str) -> bool {
        self.factories.contains_key(type_tag)
    }

    /// Registered tags in registration order.
    #[must_use]
    pub fn type_tags(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiates a module of type `type_tag`.
    pub fn create(&self, type_tag: &str, spec: ModuleSpec) -> Result<Box<dyn Module>, ConfigError> {
        let factory = self
            .factories
            .get(type_tag)
            .ok_or_else(|| ConfigError::UnknownModuleType {
                module: spec.id.clone(),
                type_tag: type_tag.to_string(),
            })?;
        factory(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ModuleError, message::{Inputs, Outputs}};
    use shared_audit::MemoryAuditBus;

    struct Idle(ModuleSpec);

    impl Module for Idle {
        fn spec(&self) -> &ModuleSpec {
            &self.0
        }

        fn step(&mut self, _inputs: &Inputs) -> Result<Outputs, ModuleError> {
            Ok(Outputs::new())
        }
    }

    #[test]
    fn creates_registered_types() {
        let bus = Arc::new(MemoryAuditBus::new(8));
        let mut registry = ModuleRegistry::new(bus.clone());
        registry.register("Idle", |spec| Ok(Box::new(Idle(spec)) as Box<dyn Module>));
        assert!(registry.contains("Idle"));
        assert_eq!(registry.type_tags(), vec!["Idle"]);
        assert_eq!(bus.count("module_loaded"), 1);

        let spec = ModuleSpec::new("idle-1", Vec::<String>::new(), ["x"], 1.0).unwrap();
        let module = registry.create("Idle", spec).unwrap();
        assert_eq!(module.id(), "idle-1");
    }

    #[test]
    fn unknown_type_is_a_config_error() {
        let registry = ModuleRegistry::default();
        let spec = ModuleSpec::new("m", Vec::<String>::new(), ["x"], 1.0).unwrap();
        let err = registry.create("Missing", spec).err().unwrap();
        assert!(matches!(
            err,
            ConfigError::UnknownModuleType { ref type_tag, .. } if type_tag == "Missing"
        ));
    }
}
