//! The test-running application.
//!
//! On its first tick [`TestApplication`] discovers the suite and wraps it in
//! a [`TickDriver`]. Every following tick advances the driver by one step;
//! while the driver waits on a promise the worker is parked, and when the
//! run finishes the report is handed back and the worker shuts down.

use std::io::Write;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::config::RunConfig;
use crate::discovery::Loader;
use crate::driver::{Tick, TickDriver};
use crate::logging;
use crate::registry::ModuleRegistry;
use crate::report::{ResultSink, RunReport};
use crate::step::ProducerExt;
use crate::suite::SuiteRunner;
use crate::worker::{Application, Worker};

pub struct TestApplication {
    config: RunConfig,
    registry: Arc<ModuleRegistry>,
    output: Option<Box<dyn Write + Send>>,
    driver: Option<TickDriver>,
    sink: ResultSink,
    report_tx: Option<oneshot::Sender<RunReport>>,
}

impl TestApplication {
    /// The receiver yields the report once the run is over.
    pub fn new(
        config: RunConfig,
        registry: Arc<ModuleRegistry>,
    ) -> (Self, oneshot::Receiver<RunReport>) {
        let (report_tx, report_rx) = oneshot::channel();
        let sink = ResultSink::new(config.failfast);
        let app = Self {
            config,
            registry,
            output: None,
            driver: None,
            sink,
            report_tx: Some(report_tx),
        };
        (app, report_rx)
    }

    /// Write the summary here instead of stderr.
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = Some(output);
        self
    }

    fn start(&mut self, worker: &Worker) -> TickDriver {
        let classes = Loader::new(&self.config, &self.registry).load(worker.mailbox());
        info!("Loaded {} test classes", classes.len());
        self.sink = ResultSink::new(self.config.failfast);
        let mut runner = SuiteRunner::new(classes, self.sink.clone());
        if let Some(output) = self.output.take() {
            runner = runner.with_output(output);
        }
        TickDriver::with_wake(runner.boxed(), worker.wake_handle())
    }

    fn finish(&mut self, worker: &mut Worker) {
        let report = self.sink.snapshot();
        if let Some(tx) = self.report_tx.take() {
            if tx.send(report).is_err() {
                debug!("Nobody is waiting for the report");
            }
        }
        worker.shut_down();
    }
}

impl Application for TestApplication {
    fn name(&self) -> &str {
        "test"
    }

    fn load_config(&mut self, options: &Map<String, Value>) -> anyhow::Result<()> {
        self.config.apply_overrides(options)?;
        Ok(())
    }

    fn configure_logging(&mut self) {
        if let Err(e) = logging::init(self.config.verbosity) {
            eprintln!("Could not configure logging: {}", e);
        }
    }

    fn worker_task(&mut self, worker: &mut Worker) -> anyhow::Result<()> {
        if self.driver.is_none() {
            let driver = self.start(worker);
            self.driver = Some(driver);
        }
        let Some(driver) = self.driver.as_mut() else {
            return Ok(());
        };
        match driver.tick() {
            Tick::Suspended => worker.park(),
            Tick::Finished(outcome) => {
                if let Err(signal) = outcome {
                    error!("Test run aborted: {}", signal);
                }
                self.finish(worker);
            }
            Tick::Yielded(_) | Tick::Descended | Tick::Ascended => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Envelope, Mailbox, Transport};
    use crate::discovery::DirExtractor;
    use crate::error::{EngineResult, Signal};
    use crate::registry::SuiteContext;
    use crate::suite::TestClass;
    use crate::unit::Unit;
    use std::time::Duration;

    struct Nowhere;

    impl Transport for Nowhere {
        fn post(&self, _envelope: Envelope) -> EngineResult<()> {
            Ok(())
        }
    }

    struct Arithmetic;

    impl TestClass for Arithmetic {
        fn name(&self) -> &str {
            "Arithmetic"
        }

        fn units(&mut self) -> Vec<Unit> {
            vec![
                Unit::sync("test_add", |_| {
                    crate::ensure_eq!(1 + 1, 2);
                    Ok(())
                }),
                Unit::sync("test_skip", |_| Err(Signal::skip("later"))),
            ]
        }
    }

    #[tokio::test]
    async fn test_runs_discovered_suite_to_report() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("regression").join("math")).unwrap();
        let config = RunConfig {
            extractors: vec![Arc::new(DirExtractor::new(dir.path()))],
            ..RunConfig::default()
        };
        let registry = ModuleRegistry::new().register_class("regression.math", |_: &SuiteContext| {
            Box::new(Arithmetic) as Box<dyn TestClass>
        });

        let (app, report_rx) = TestApplication::new(config, Arc::new(registry));
        let mut app = app.with_output(Box::new(std::io::sink()));
        let (mailbox, inbox) = Mailbox::new("test-worker", Arc::new(Nowhere));
        tokio::time::timeout(Duration::from_secs(5), Worker::new(mailbox, inbox).run(&mut app))
            .await
            .expect("run should finish")
            .unwrap();

        let report = report_rx.await.unwrap();
        assert_eq!(report.tests_run, 2);
        assert_eq!(report.successes, vec!["Arithmetic.test_add"]);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.was_successful());
    }

    #[test]
    fn test_load_config_overrides() {
        let (mut app, _rx) = TestApplication::new(RunConfig::default(), Arc::new(ModuleRegistry::new()));
        let options = serde_json::json!({"failfast": true});
        app.load_config(options.as_object().unwrap()).unwrap();
        assert!(app.config.failfast);
    }
}
