//! Test discovery.
//!
//! Every [`Extractor`] points at a test directory for a given kind. Each
//! sub-directory there is an application; the extractor names the module
//! holding its tests and the [`Loader`] resolves that name in the
//! [`ModuleRegistry`]. Discovery is fail-soft: a module that cannot be
//! resolved is logged and skipped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::actor::Mailbox;
use crate::config::RunConfig;
use crate::registry::{ModuleRegistry, SuiteContext};
use crate::suite::TestClass;
use crate::types::{AppName, ModuleName};

/// Locates test directories and names their modules.
pub trait Extractor: Send + Sync {
    /// Directory whose sub-directories hold tests of `kind`.
    fn testdir(&self, kind: &str) -> PathBuf;

    /// Module name for the tests of `app`, found in `location`.
    fn test_module(&self, kind: &str, location: &str, app: &str) -> ModuleName;
}

/// Extractor over `<root>/<kind>/<app>/`. Modules are named
/// `<location>.<app>`, where location is the last component of the test
/// directory.
#[derive(Debug, Clone)]
pub struct DirExtractor {
    root: PathBuf,
}

impl DirExtractor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Extractor for DirExtractor {
    fn testdir(&self, kind: &str) -> PathBuf {
        self.root.join(kind)
    }

    fn test_module(&self, _kind: &str, location: &str, app: &str) -> ModuleName {
        ModuleName::new(format!("{}.{}", location, app))
    }
}

/// A module the loader resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredModule {
    pub app: AppName,
    pub module: ModuleName,
}

/// `(location, app)` pairs under `dir`, sorted by app name. Names starting
/// with `__` are ignored. The location is the last component of `dir`.
pub fn get_tests(dir: &Path) -> Vec<(String, String)> {
    let location = dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Could not read test directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };
    let mut apps: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with("__"))
        .collect();
    apps.sort();
    apps.into_iter().map(|app| (location.clone(), app)).collect()
}

/// Resolves discovered directories into test classes.
pub struct Loader<'a> {
    config: &'a RunConfig,
    registry: &'a ModuleRegistry,
}

impl<'a> Loader<'a> {
    pub fn new(config: &'a RunConfig, registry: &'a ModuleRegistry) -> Self {
        Self { config, registry }
    }

    /// Modules to load, in extractor then directory order.
    pub fn modules(&self) -> Vec<DiscoveredModule> {
        let kind = &self.config.kind;
        let mut found = Vec::new();
        for extractor in &self.config.extractors {
            let testdir = extractor.testdir(kind);
            for (location, app) in get_tests(&testdir) {
                if self.config.tags.contains(&app) {
                    debug!("Skipping tests for {}", app);
                    continue;
                }
                let module = extractor.test_module(kind, &location, &app);
                if let Err(e) = self.registry.get(module.as_str()) {
                    debug!("Could not load tests for {}: {}", module, e);
                    continue;
                }
                debug!("Adding tests for {}", app);
                found.push(DiscoveredModule {
                    app: AppName::new(app),
                    module,
                });
            }
        }
        found
    }

    /// Instantiate every class of every discovered module, keeping those
    /// whose tag passes the filters.
    pub fn load(&self, mailbox: &Mailbox) -> Vec<Box<dyn TestClass>> {
        let config = Arc::new(self.config.clone());
        let mut classes = Vec::new();
        for found in self.modules() {
            let Ok(factories) = self.registry.get(found.module.as_str()) else {
                continue;
            };
            let ctx = SuiteContext {
                mailbox: mailbox.clone(),
                app: found.app.clone(),
                module: found.module.clone(),
                config: config.clone(),
            };
            for factory in factories {
                let class = factory(&ctx);
                if !self.accepts(class.as_ref()) {
                    debug!("Excluding {} by tag", class.name());
                    continue;
                }
                classes.push(class);
            }
        }
        classes
    }

    fn accepts(&self, class: &dyn TestClass) -> bool {
        match class.tag() {
            None => true,
            Some(tag) => !self.config.tags.contains(tag) && self.config.include_tags.contains(tag),
        }
    }
}
