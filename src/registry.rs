//! Declarative table of test modules, populated at startup.
//!
//! Each module name maps to the factories of the classes it defines. The
//! loader looks modules up by the name its extractor computes, so only what
//! was registered here can ever be discovered.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::actor::Mailbox;
use crate::config::RunConfig;
use crate::error::{EngineError, EngineResult};
use crate::suite::TestClass;
use crate::types::{AppName, ModuleName};

/// What a class factory gets to build its class with.
#[derive(Clone)]
pub struct SuiteContext {
    /// Mailbox of the worker running the suite.
    pub mailbox: Mailbox,
    pub app: AppName,
    pub module: ModuleName,
    pub config: Arc<RunConfig>,
}

pub type ClassFactory = Arc<dyn Fn(&SuiteContext) -> Box<dyn TestClass> + Send + Sync>;

/// Registry of test modules by name.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<ModuleName, Vec<ClassFactory>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class to `module`, creating the module on first use.
    pub fn register_class<F>(mut self, module: impl Into<ModuleName>, factory: F) -> Self
    where
        F: Fn(&SuiteContext) -> Box<dyn TestClass> + Send + Sync + 'static,
    {
        self.modules
            .entry(module.into())
            .or_default()
            .push(Arc::new(factory));
        self
    }

    /// Register a whole module. Registering a name again replaces it.
    pub fn insert(&mut self, module: impl Into<ModuleName>, classes: Vec<ClassFactory>) {
        self.modules.insert(module.into(), classes);
    }

    pub fn unregister(&mut self, module: &str) -> EngineResult<Vec<ClassFactory>> {
        self.modules
            .remove(module)
            .ok_or_else(|| EngineError::NotRegistered(module.to_string()))
    }

    pub fn get(&self, module: &str) -> EngineResult<&[ClassFactory]> {
        self.modules
            .get(module)
            .map(Vec::as_slice)
            .ok_or_else(|| EngineError::NotRegistered(module.to_string()))
    }

    pub fn contains(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    /// Registered module names, sorted.
    pub fn list_names(&self) -> Vec<ModuleName> {
        self.modules.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
