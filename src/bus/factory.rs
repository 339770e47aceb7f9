//! Named service factories resolved from static configuration.
//!
//! Instead of loading implementation code at runtime, every service module
//! the process can host is registered here under a module name at startup.
//! Configuration then refers to modules by name.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use super::service::{Service, ServiceArgs, ServiceContext};

/// Builds a service from its context and construction arguments.
///
/// Returning `Err` aborts registration; the message becomes the
/// initialization error reported to the caller.
pub type Factory =
    dyn Fn(ServiceContext, &ServiceArgs) -> Result<Arc<dyn Service>, String> + Send + Sync;

/// Module name → factory.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: DashMap<String, Arc<Factory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `module`, replacing any previous one.
    pub fn register<F>(&self, module: impl Into<String>, factory: F)
    where
        F: Fn(ServiceContext, &ServiceArgs) -> Result<Arc<dyn Service>, String>
            + Send
            + Sync
            + 'static,
    {
        let module = module.into();
        tracing::debug!(module = %module, "registered service factory");
        self.factories.insert(module, Arc::new(factory));
    }

    pub fn get(&self, module: &str) -> Option<Arc<Factory>> {
        self.factories.get(module).map(|f| Arc::clone(f.value()))
    }

    pub fn contains(&self, module: &str) -> bool {
        self.factories.contains_key(module)
    }

    /// Registered module names, sorted.
    pub fn modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("modules", &self.modules())
            .finish()
    }
}
