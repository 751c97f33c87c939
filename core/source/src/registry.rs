//! Source registry for resolving implementations by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use assetsync_common::{Error, Result};

use crate::provider::SourceOfTruth;

/// Factory function type for creating sources.
pub type SourceFactory = Box<dyn Fn(Value) -> Result<Arc<dyn SourceOfTruth>> + Send + Sync>;

/// Registry of source factories keyed by kind.
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
}

impl SourceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a source factory.
    ///
    /// # Errors
    /// - `AlreadyExists` if `name` is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: SourceFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Source '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a source by kind and configuration.
    ///
    /// # Errors
    /// - `Config` if the kind is unknown or the configuration is invalid
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn SourceOfTruth>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::Config(format!(
                "Unknown source kind '{}' (known: {})",
                name,
                self.sources().join(", ")
            ))
        })?;
        factory(config)
    }

    /// Registered kinds, sorted.
    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in sources: `memory`, `local`, `github`.
pub fn create_default_registry() -> SourceRegistry {
    let mut factories: HashMap<String, SourceFactory> = HashMap::new();

    factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(crate::memory::MemorySource::new()))),
    );

    factories.insert(
        "local".to_string(),
        Box::new(|config| {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Config("Local source requires 'root' path".to_string()))?;
            Ok(Arc::new(crate::local::LocalSource::new(root)?))
        }),
    );

    factories.insert(
        "github".to_string(),
        Box::new(crate::github::create_github_source),
    );

    SourceRegistry { factories }
}
