//! Test classes and the producers that run them.
//!
//! A [`TestClass`] groups execution units behind optional class-level hooks.
//! [`SuiteRunner`] is the outermost producer of a run: it descends into one
//! [`ClassRunner`] per class, then renders the summary.

use std::collections::VecDeque;
use std::io::Write;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Signal;
use crate::report::{Outcome, ResultSink};
use crate::step::{BoxProducer, Producer, ProducerExt, Resume, Step};
use crate::unit::Unit;

/// A discovered class exposing execution units.
///
/// Every hook besides [`TestClass::name`] and [`TestClass::units`] is optional.
pub trait TestClass: Send {
    fn name(&self) -> &str;

    /// Group tag used for include/exclude filtering.
    fn tag(&self) -> Option<&str> {
        None
    }

    /// Class-level setup, run once before the first unit. It may suspend.
    fn init_tests(&mut self) -> Option<BoxProducer> {
        None
    }

    /// Class-level teardown, run once after the last unit.
    fn end_tests(&mut self) -> Option<BoxProducer> {
        None
    }

    /// The units to run. Called after `init_tests` has completed.
    fn units(&mut self) -> Vec<Unit>;
}

enum ClassPhase {
    Start,
    Init,
    Units(VecDeque<Unit>),
    End,
    Ending,
    Done,
}

/// Producer running one class: `init_tests`, each unit, `end_tests`.
pub struct ClassRunner {
    class: Box<dyn TestClass>,
    sink: ResultSink,
    phase: ClassPhase,
}

impl ClassRunner {
    pub fn new(class: Box<dyn TestClass>, sink: ResultSink) -> Self {
        Self {
            class,
            sink,
            phase: ClassPhase::Start,
        }
    }

    fn load_units(&mut self) -> VecDeque<Unit> {
        let prefix = self.class.name().to_string();
        self.class
            .units()
            .into_iter()
            .map(|unit| unit.qualified(&prefix))
            .collect()
    }

    /// Record every unit as skipped after a class-level skip.
    fn skip_all(&mut self, reason: &str) {
        for unit in self.load_units() {
            self.sink.start_unit(unit.name());
            self.sink
                .record(unit.name(), Outcome::Skipped, Some(reason.to_string()));
            self.sink.stop_unit(unit.name());
        }
    }
}

impl Producer for ClassRunner {
    fn resume(&mut self, input: Resume) -> Result<Step, Signal> {
        let mut input = input;
        loop {
            match std::mem::replace(&mut self.phase, ClassPhase::Done) {
                ClassPhase::Start => {
                    if self.sink.should_stop() {
                        continue;
                    }
                    debug!("Running class {}", self.class.name());
                    match self.class.init_tests() {
                        Some(init) => {
                            self.phase = ClassPhase::Init;
                            return Ok(Step::SubTask(init));
                        }
                        None => self.phase = ClassPhase::Units(self.load_units()),
                    }
                }
                ClassPhase::Init => match std::mem::replace(&mut input, Resume::Next) {
                    Resume::Throw(Signal::Skip(reason)) => {
                        debug!("Class {} skipped: {}", self.class.name(), reason);
                        self.skip_all(&reason);
                    }
                    Resume::Throw(signal) => {
                        let name = format!("{}.init_tests", self.class.name());
                        self.sink.add_error(&name, signal.to_string());
                    }
                    _ => self.phase = ClassPhase::Units(self.load_units()),
                },
                ClassPhase::Units(mut queue) => {
                    if self.sink.should_stop() {
                        self.phase = ClassPhase::End;
                        continue;
                    }
                    match queue.pop_front() {
                        Some(unit) => {
                            self.phase = ClassPhase::Units(queue);
                            let runner = unit.into_runner(self.sink.clone());
                            return Ok(Step::SubTask(runner.boxed()));
                        }
                        None => self.phase = ClassPhase::End,
                    }
                }
                ClassPhase::End => {
                    if let Some(end) = self.class.end_tests() {
                        self.phase = ClassPhase::Ending;
                        return Ok(Step::SubTask(end));
                    }
                }
                ClassPhase::Ending => {
                    if let Resume::Throw(signal) = std::mem::replace(&mut input, Resume::Next) {
                        let name = format!("{}.end_tests", self.class.name());
                        self.sink.add_error(&name, signal.to_string());
                    }
                }
                ClassPhase::Done => return Ok(Step::Done(Value::Null)),
            }
        }
    }
}

/// Outermost producer of a run.
///
/// Descends into each class in order, stops early when the sink asks for it,
/// writes the summary and returns the report as JSON.
pub struct SuiteRunner {
    classes: VecDeque<Box<dyn TestClass>>,
    sink: ResultSink,
    output: Box<dyn Write + Send>,
    started: bool,
}

impl SuiteRunner {
    pub fn new(classes: Vec<Box<dyn TestClass>>, sink: ResultSink) -> Self {
        Self {
            classes: classes.into(),
            sink,
            output: Box::new(std::io::stderr()),
            started: false,
        }
    }

    /// Write the summary somewhere other than stderr.
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = output;
        self
    }

    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }

    fn end(&mut self) -> Result<Step, Signal> {
        self.sink.stop_run();
        let report = self.sink.snapshot();
        if let Err(e) = self
            .output
            .write_all(report.summary().as_bytes())
            .and_then(|_| self.output.flush())
        {
            warn!("Could not write the run summary: {}", e);
        }
        let value = serde_json::to_value(&report).map_err(Signal::error)?;
        Ok(Step::Done(value))
    }
}

impl Producer for SuiteRunner {
    fn resume(&mut self, _input: Resume) -> Result<Step, Signal> {
        if !self.started {
            self.started = true;
            self.sink.start_run();
        }
        if self.sink.should_stop() {
            debug!("Stopping the run early");
            self.classes.clear();
        }
        match self.classes.pop_front() {
            Some(class) => Ok(Step::SubTask(
                ClassRunner::new(class, self.sink.clone()).boxed(),
            )),
            None => self.end(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::Promise;
    use crate::step::{from_fn, once, wait};
    use crate::trampoline::{Emit, Frames};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    /// A class whose init step fails, skips or succeeds with a value that
    /// units read back.
    struct Fixture {
        name: &'static str,
        init: Option<Result<Value, Signal>>,
        shared: Arc<Mutex<Option<Value>>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Fixture {
        fn new(name: &'static str, init: Option<Result<Value, Signal>>) -> Self {
            Self {
                name,
                init,
                shared: Arc::default(),
                log: Arc::default(),
            }
        }
    }

    impl TestClass for Fixture {
        fn name(&self) -> &str {
            self.name
        }

        fn init_tests(&mut self) -> Option<BoxProducer> {
            let init = self.init.take()?;
            let shared = self.shared.clone();
            Some(
                once(move || {
                    let value = init?;
                    *shared.lock() = Some(value.clone());
                    Ok(value)
                })
                .boxed(),
            )
        }

        fn end_tests(&mut self) -> Option<BoxProducer> {
            self.log.lock().push("end".to_string());
            None
        }

        fn units(&mut self) -> Vec<Unit> {
            let shared = self.shared.clone();
            let log = self.log.clone();
            vec![
                Unit::sync("test_shared", move |_| {
                    log.lock().push("unit".to_string());
                    crate::ensure_eq!(*shared.lock(), Some(json!("app")));
                    Ok(())
                }),
                Unit::sync("test_fails", |_| Err(Signal::failure("1 != 2"))),
            ]
        }
    }

    fn run(classes: Vec<Box<dyn TestClass>>, failfast: bool) -> (Value, String) {
        let buf = SharedBuf::default();
        let runner = SuiteRunner::new(classes, ResultSink::new(failfast)).with_output(Box::new(buf.clone()));
        let mut frames = Frames::new(runner.boxed());
        loop {
            match frames.advance(Resume::Next).unwrap() {
                Emit::Finished(report) => return (report, buf.text()),
                Emit::Value(_) => {}
                Emit::Awaitable(p) => panic!("nothing should suspend here: {:?}", p),
            }
        }
    }

    #[test]
    fn test_class_lifecycle() {
        let fixture = Fixture::new("Chat", Some(Ok(json!("app"))));
        let log = fixture.log.clone();
        let (report, summary) = run(vec![Box::new(fixture)], false);

        assert_eq!(report["tests_run"], json!(2));
        assert_eq!(report["successes"], json!(["Chat.test_shared"]));
        assert_eq!(report["failures"][0]["name"], json!("Chat.test_fails"));
        assert_eq!(*log.lock(), vec!["unit", "end"]);
        assert!(summary.contains("FAIL: Chat.test_fails"));
        assert!(summary.contains("Ran 2 tests in"));
        assert!(summary.ends_with("FAILED (failures=1, errors=0)\n"));
    }

    #[test]
    fn test_init_error_skips_units() {
        let fixture = Fixture::new("Broken", Some(Err(Signal::msg("bind failed"))));
        let log = fixture.log.clone();
        let (report, _) = run(vec![Box::new(fixture)], false);

        assert_eq!(report["tests_run"], json!(0));
        assert_eq!(report["errors"][0]["name"], json!("Broken.init_tests"));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_init_skip_skips_every_unit() {
        let fixture = Fixture::new("Django", Some(Err(Signal::skip("Requires django"))));
        let (report, summary) = run(vec![Box::new(fixture)], false);

        assert_eq!(report["tests_run"], json!(2));
        assert_eq!(report["skipped"].as_array().map(Vec::len), Some(2));
        assert!(summary.ends_with("OK (skipped=2)\n"));
    }

    #[test]
    fn test_failfast_stops_following_classes() {
        let first = Fixture::new("First", Some(Ok(json!("app"))));
        let second = Fixture::new("Second", Some(Ok(json!("app"))));
        let second_log = second.log.clone();
        let (report, _) = run(vec![Box::new(first), Box::new(second)], true);

        assert_eq!(report["tests_run"], json!(2));
        assert!(second_log.lock().is_empty());
    }

    struct Awaiting(Promise);

    impl TestClass for Awaiting {
        fn name(&self) -> &str {
            "Awaiting"
        }

        fn init_tests(&mut self) -> Option<BoxProducer> {
            Some(wait(self.0.clone()).boxed())
        }

        fn units(&mut self) -> Vec<Unit> {
            vec![Unit::new("test_value", |_| {
                Ok(from_fn(|_| Ok(Step::Done(json!("ok")))).boxed())
            })]
        }
    }

    #[test]
    fn test_class_init_can_suspend() {
        let promise = Promise::new();
        let runner = SuiteRunner::new(vec![Box::new(Awaiting(promise.clone()))], ResultSink::new(false))
            .with_output(Box::new(std::io::sink()));
        let mut frames = Frames::new(runner.boxed());
        assert!(matches!(frames.advance(Resume::Next).unwrap(), Emit::Awaitable(_)));
        promise.resolve(json!({"address": ["127.0.0.1", 8060]})).unwrap();
        let report = match frames.advance(Resume::Value(promise.result().unwrap())).unwrap() {
            Emit::Finished(report) => report,
            other => panic!("expected the run to finish, got {:?}", other),
        };
        assert_eq!(report["successes"], json!(["Awaiting.test_value"]));
    }
}
