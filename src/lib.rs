// Primitives
pub mod error;
pub mod promise;
pub mod gather;
pub mod step;
pub mod trampoline;

// Suites and reporting
pub mod unit;
pub mod suite;
pub mod report;

// Hosting
pub mod driver;
pub mod actor;
pub mod arbiter;
pub mod deadline;
pub mod worker;
pub mod application;

// Discovery and setup
pub mod config;
pub mod context;
pub mod discovery;
pub mod logging;
pub mod registry;
pub mod types;

pub mod demo;


// Re-export key types and functions
pub use actor::{ApplicationHandle, Command, IsolationMode, Mailbox, Transport, ARBITER};
pub use application::TestApplication;
pub use arbiter::{Arbiter, FunctionTable};
pub use config::{RunConfig, RunOptions};
pub use context::EngineContext;
pub use driver::{Tick, TickDriver};
pub use error::{EngineError, EngineResult, Signal};
pub use gather::{Gather, Member, gather, gather_map};
pub use promise::{Chained, Promise, Settled};
pub use registry::{ModuleRegistry, SuiteContext};
pub use report::{Outcome, ResultSink, RunReport};
pub use step::{BoxProducer, Producer, ProducerExt, Resume, Step};
pub use suite::{SuiteRunner, TestClass};
pub use unit::{Unit, UnitContext};
pub use worker::{Application, Worker};

use serde_json::Map;

/// Convenience function to run a whole suite: start the engine, run the
/// tests in a worker, tear the engine down.
pub async fn run_suite(
    config: RunConfig,
    registry: ModuleRegistry,
    functions: FunctionTable,
) -> anyhow::Result<RunReport> {
    let context = EngineContext::init(config, registry, functions)?;
    let report = context.run_tests(Map::new()).await;
    context.teardown().await?;
    report
}
