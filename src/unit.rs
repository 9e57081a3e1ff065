//! Execution units: one setup/body/teardown lifecycle driven as a producer.
//!
//! A [`UnitRunner`] walks `INIT → RUNNING → CLOSING → DONE`:
//!
//! - `INIT` runs setup synchronously. A skip records `skipped` and an error
//!   records `error`; either way the unit jumps straight to `DONE` and neither
//!   the body nor the teardown runs.
//! - `RUNNING` steps the body through its own frame stack, surfacing plain
//!   values and promises to whoever drives the unit.
//! - `CLOSING` runs teardown, then cleanups in reverse registration order. An
//!   error there turns a successful unit into an error.
//! - `DONE` records the outcome and notifies the sink, once.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::error::Signal;
use crate::report::{Outcome, ResultSink};
use crate::step::{BoxProducer, Producer, ProducerExt, Resume, Step, once};
use crate::trampoline::{Emit, Frames};

pub type Hook = Box<dyn FnOnce(&UnitContext) -> Result<(), Signal> + Send>;
pub type Body = Box<dyn FnOnce(&UnitContext) -> Result<BoxProducer, Signal> + Send>;
pub type Cleanup = Box<dyn FnOnce() -> Result<(), Signal> + Send>;

/// Handle given to a unit's hooks and body.
#[derive(Clone)]
pub struct UnitContext {
    name: Arc<str>,
    cleanups: Arc<Mutex<Vec<Cleanup>>>,
}

impl UnitContext {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            cleanups: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a callable to run after teardown. Cleanups run last
    /// registered first.
    pub fn add_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() -> Result<(), Signal> + Send + 'static,
    {
        self.cleanups.lock().push(Box::new(cleanup));
    }
}

/// Definition of one execution unit.
pub struct Unit {
    name: String,
    set_up: Option<Hook>,
    body: Body,
    tear_down: Option<Hook>,
    cleanups: Vec<Cleanup>,
    expected_failure: bool,
}

impl Unit {
    /// A unit whose body is a producer built when the unit starts running.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(&UnitContext) -> Result<BoxProducer, Signal> + Send + 'static,
    {
        Self {
            name: name.into(),
            set_up: None,
            body: Box::new(body),
            tear_down: None,
            cleanups: Vec::new(),
            expected_failure: false,
        }
    }

    /// A unit whose body never suspends.
    pub fn sync<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(&UnitContext) -> Result<(), Signal> + Send + 'static,
    {
        Self::new(name, move |ctx| {
            let ctx = ctx.clone();
            Ok(once(move || body(&ctx).map(|_| Value::Null)).boxed())
        })
    }

    pub fn set_up<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&UnitContext) -> Result<(), Signal> + Send + 'static,
    {
        self.set_up = Some(Box::new(hook));
        self
    }

    pub fn tear_down<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&UnitContext) -> Result<(), Signal> + Send + 'static,
    {
        self.tear_down = Some(Box::new(hook));
        self
    }

    pub fn cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() -> Result<(), Signal> + Send + 'static,
    {
        self.cleanups.push(Box::new(cleanup));
        self
    }

    /// Failures count as expected; a pass counts as an unexpected success.
    pub fn expected_failure(mut self) -> Self {
        self.expected_failure = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prefix the unit name, typically with its class name.
    pub fn qualified(mut self, prefix: &str) -> Self {
        self.name = format!("{}.{}", prefix, self.name);
        self
    }

    /// Bind the unit to a sink, ready to be driven.
    pub fn into_runner(self, sink: ResultSink) -> UnitRunner {
        UnitRunner::new(self, sink)
    }
}

/// Lifecycle phase of a running unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Running,
    Closing,
    Done,
}

/// Producer driving one [`Unit`] through its lifecycle.
pub struct UnitRunner {
    name: String,
    set_up: Option<Hook>,
    body: Option<Body>,
    tear_down: Option<Hook>,
    expected_failure: bool,
    ctx: UnitContext,
    sink: ResultSink,
    phase: Phase,
    frames: Frames,
    body_outcome: Option<(Outcome, Option<String>)>,
    outcome: Option<Outcome>,
}

impl UnitRunner {
    pub fn new(unit: Unit, sink: ResultSink) -> Self {
        let ctx = UnitContext::new(&unit.name);
        ctx.cleanups.lock().extend(unit.cleanups);
        Self {
            name: unit.name,
            set_up: unit.set_up,
            body: Some(unit.body),
            tear_down: unit.tear_down,
            expected_failure: unit.expected_failure,
            ctx,
            sink,
            phase: Phase::Init,
            frames: Frames::default(),
            body_outcome: None,
            outcome: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The recorded outcome, once the unit is done.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    fn start(&mut self) -> Option<(Outcome, Option<String>)> {
        self.sink.start_unit(&self.name);
        if let Some(set_up) = self.set_up.take() {
            if let Err(signal) = set_up(&self.ctx) {
                let outcome = match signal {
                    Signal::Skip(_) => Outcome::Skipped,
                    _ => Outcome::Error,
                };
                return Some((outcome, Some(detail(&signal))));
            }
        }
        let Some(body) = self.body.take() else {
            self.phase = Phase::Closing;
            return None;
        };
        match body(&self.ctx) {
            Ok(producer) => {
                self.frames = Frames::new(producer);
                self.phase = Phase::Running;
            }
            Err(signal) => {
                self.body_outcome = Some((signal.classify(), Some(detail(&signal))));
                self.phase = Phase::Closing;
            }
        }
        None
    }

    /// Run teardown and cleanups; returns the collected error details.
    fn close(&mut self) -> Option<String> {
        let mut errors = Vec::new();
        if let Some(tear_down) = self.tear_down.take() {
            if let Err(signal) = tear_down(&self.ctx) {
                errors.push(format!("tear down: {}", signal));
            }
        }
        let cleanups = std::mem::take(&mut *self.ctx.cleanups.lock());
        for cleanup in cleanups.into_iter().rev() {
            if let Err(signal) = cleanup() {
                errors.push(format!("cleanup: {}", signal));
            }
        }
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("\n"))
        }
    }

    fn finish(&mut self, outcome: Outcome, detail: Option<String>) -> Result<Step, Signal> {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
            self.sink.record(&self.name, outcome, detail);
            self.sink.stop_unit(&self.name);
        }
        self.phase = Phase::Done;
        Ok(Step::Done(Value::Null))
    }

    fn expectation(&self, outcome: Outcome) -> Outcome {
        if !self.expected_failure {
            return outcome;
        }
        match outcome {
            Outcome::Failure | Outcome::Error => Outcome::ExpectedFailure,
            Outcome::Success => Outcome::UnexpectedSuccess,
            other => other,
        }
    }
}

impl Producer for UnitRunner {
    fn resume(&mut self, input: Resume) -> Result<Step, Signal> {
        let mut input = input;
        loop {
            match self.phase {
                Phase::Init => {
                    if let Some((outcome, detail)) = self.start() {
                        debug!("Set up of {} did not succeed: {:?}", self.name, outcome);
                        return self.finish(outcome, detail);
                    }
                    input = Resume::Next;
                }
                Phase::Running => match self.frames.advance(std::mem::replace(&mut input, Resume::Next)) {
                    Ok(Emit::Value(value)) => return Ok(Step::Value(value)),
                    Ok(Emit::Awaitable(promise)) => return Ok(Step::Awaitable(promise)),
                    Ok(Emit::Finished(_)) => {
                        self.body_outcome = Some((Outcome::Success, None));
                        self.phase = Phase::Closing;
                    }
                    Err(signal) => {
                        self.body_outcome = Some((signal.classify(), Some(detail(&signal))));
                        self.phase = Phase::Closing;
                    }
                },
                Phase::Closing => {
                    let (body, body_detail) =
                        self.body_outcome.take().unwrap_or((Outcome::Success, None));
                    let body = self.expectation(body);
                    let (outcome, detail) = match (body, self.close()) {
                        (_, None) => (body, body_detail),
                        (Outcome::Success | Outcome::UnexpectedSuccess, Some(closing)) => {
                            (Outcome::Error, Some(closing))
                        }
                        // A failed body keeps its outcome; anything else becomes an error.
                        (other, Some(closing)) => {
                            let detail = match body_detail {
                                Some(body_detail) => format!("{}\n{}", body_detail, closing),
                                None => closing,
                            };
                            match other {
                                Outcome::Failure | Outcome::Error => (other, Some(detail)),
                                _ => (Outcome::Error, Some(detail)),
                            }
                        }
                    };
                    return self.finish(outcome, detail);
                }
                Phase::Done => return Ok(Step::Done(Value::Null)),
            }
        }
    }
}

fn detail(signal: &Signal) -> String {
    match signal {
        Signal::Skip(reason) => reason.clone(),
        other => other.to_string(),
    }
}
