//! Process-scoped engine state.
//!
//! [`EngineContext::init`] installs logging, starts the arbiter with its
//! function table and keeps the module registry. Components receive what
//! they need from it; [`EngineContext::teardown`] stops the arbiter.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::TestApplication;
use crate::arbiter::{Arbiter, ArbiterState, FunctionTable};
use crate::config::RunConfig;
use crate::discovery::{DiscoveredModule, Loader};
use crate::logging;
use crate::registry::ModuleRegistry;
use crate::report::RunReport;

pub struct EngineContext {
    config: RunConfig,
    registry: Arc<ModuleRegistry>,
    arbiter: Arbiter,
    arbiter_task: JoinHandle<ArbiterState>,
}

impl EngineContext {
    /// Must be called from within a tokio runtime.
    pub fn init(
        config: RunConfig,
        registry: ModuleRegistry,
        functions: FunctionTable,
    ) -> anyhow::Result<Self> {
        logging::init(config.verbosity)?;
        info!(
            "Engine starting with {} registered modules and {} extractors",
            registry.len(),
            config.extractors.len()
        );
        let (arbiter, arbiter_task) = Arbiter::spawn(functions);
        Ok(Self {
            config,
            registry: Arc::new(registry),
            arbiter,
            arbiter_task,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    /// Modules a run would load, without running anything.
    pub fn discover(&self) -> Vec<DiscoveredModule> {
        Loader::new(&self.config, &self.registry).modules()
    }

    /// Run the suite in a test worker and wait for its report.
    pub async fn run_tests(&self, options: Map<String, Value>) -> anyhow::Result<RunReport> {
        let (app, report_rx) = TestApplication::new(self.config.clone(), self.registry.clone());
        let worker = self
            .arbiter
            .spawn_worker("test-worker", app, self.config.isolation, options)?;
        let joined = worker.join().await;
        let report = report_rx.await;
        joined?;
        report.map_err(|_| anyhow::anyhow!("test worker stopped before reporting"))
    }

    /// Stop the arbiter and wait for it. Returns its final state.
    pub async fn teardown(self) -> anyhow::Result<ArbiterState> {
        self.arbiter.stop();
        let state = self.arbiter_task.await?;
        if !state.application_names().is_empty() {
            warn!("Tearing down with {} applications still running", state.application_names().len());
        }
        info!("Engine stopped");
        Ok(state)
    }
}
