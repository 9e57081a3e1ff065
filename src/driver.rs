//! Tick driver: advances a producer tree one step per host-loop iteration.
//!
//! The driver owns an explicit stack of suspended producers plus the current
//! one. Each [`TickDriver::tick`] resumes the current producer exactly once and
//! reports what happened. It never blocks: when a step yields a pending
//! promise, the driver registers a listener that parks the outcome in a wake
//! slot and notifies the host, then reports [`Tick::Suspended`] until that
//! slot is filled.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::Signal;
use crate::promise::{Promise, Settled};
use crate::step::{BoxProducer, Resume, Step};

/// What a single tick did.
#[derive(Debug)]
pub enum Tick {
    /// The current producer yielded a plain value.
    Yielded(Value),
    /// Descended into a nested producer.
    Descended,
    /// A producer finished (or failed) and its parent became current.
    Ascended,
    /// Waiting on a promise; nothing advanced.
    Suspended,
    /// The outermost producer returned or failed. Repeated once reached.
    Finished(Result<Value, Signal>),
}

/// Per-worker driver state. Owned by one worker and only touched from its
/// own ticks.
pub struct TickDriver {
    current: Option<BoxProducer>,
    stack: Vec<BoxProducer>,
    input: Resume,
    waiting: Option<Promise>,
    slot: Arc<Mutex<Option<Settled>>>,
    wake: Arc<Notify>,
    finished: Option<Result<Value, Signal>>,
    steps: u64,
}

impl TickDriver {
    pub fn new(root: BoxProducer) -> Self {
        Self::with_wake(root, Arc::new(Notify::new()))
    }

    /// Share the host's notifier so settlements wake the host loop directly.
    pub fn with_wake(root: BoxProducer, wake: Arc<Notify>) -> Self {
        Self {
            current: Some(root),
            stack: Vec::new(),
            input: Resume::Next,
            waiting: None,
            slot: Arc::new(Mutex::new(None)),
            wake,
            finished: None,
            steps: 0,
        }
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Live frames, the current one included.
    pub fn depth(&self) -> usize {
        self.stack.len() + usize::from(self.current.is_some())
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// True while waiting on a promise that has not settled yet.
    pub fn is_suspended(&self) -> bool {
        self.waiting.is_some() && self.slot.lock().is_none()
    }

    /// Number of producer steps taken so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Advance exactly one step.
    pub fn tick(&mut self) -> Tick {
        if let Some(outcome) = &self.finished {
            return Tick::Finished(outcome.clone());
        }

        if self.waiting.is_some() {
            match self.slot.lock().take() {
                Some(outcome) => self.input = outcome.into(),
                None => return Tick::Suspended,
            }
            self.waiting = None;
        }

        let Some(current) = self.current.as_mut() else {
            return self.finish(Ok(Value::Null));
        };

        let input = std::mem::replace(&mut self.input, Resume::Next);
        self.steps += 1;
        match current.resume(input) {
            Ok(Step::Value(value)) => Tick::Yielded(value),
            Ok(Step::SubTask(child)) => {
                if let Some(parent) = self.current.replace(child) {
                    self.stack.push(parent);
                }
                Tick::Descended
            }
            Ok(Step::Awaitable(promise)) => {
                self.suspend(promise);
                Tick::Suspended
            }
            Ok(Step::Done(value)) => self.ascend(Ok(value)),
            Err(signal) => self.ascend(Err(signal)),
        }
    }

    /// Tick until finished, awaiting the wake notifier while suspended and
    /// yielding to the runtime between steps.
    pub async fn run_to_end(&mut self) -> Result<Value, Signal> {
        loop {
            match self.tick() {
                Tick::Finished(outcome) => return outcome,
                Tick::Suspended => self.wake.notified().await,
                _ => tokio::task::yield_now().await,
            }
        }
    }

    fn suspend(&mut self, promise: Promise) {
        let slot = self.slot.clone();
        let wake = self.wake.clone();
        promise.observe(move |outcome| {
            *slot.lock() = Some(outcome);
            wake.notify_one();
        });
        self.waiting = Some(promise);
    }

    fn ascend(&mut self, outcome: Result<Value, Signal>) -> Tick {
        self.current = self.stack.pop();
        if self.current.is_none() {
            return self.finish(outcome);
        }
        self.input = outcome.into();
        Tick::Ascended
    }

    fn finish(&mut self, outcome: Result<Value, Signal>) -> Tick {
        debug!("Driver finished after {} steps", self.steps);
        self.stack.clear();
        self.finished = Some(outcome.clone());
        Tick::Finished(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{ProducerExt, iter, once, wait};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_one_step_per_tick() {
        let child = iter(vec![Step::Value(json!("inner"))]);
        let root = iter(vec![
            Step::Value(json!("outer")),
            Step::SubTask(child.boxed()),
            Step::Value(json!("tail")),
        ]);
        let mut driver = TickDriver::new(root.boxed());

        assert!(matches!(driver.tick(), Tick::Yielded(v) if v == json!("outer")));
        assert!(matches!(driver.tick(), Tick::Descended));
        assert_eq!(driver.depth(), 2);
        assert!(matches!(driver.tick(), Tick::Yielded(v) if v == json!("inner")));
        assert!(matches!(driver.tick(), Tick::Ascended));
        assert_eq!(driver.depth(), 1);
        assert!(matches!(driver.tick(), Tick::Yielded(v) if v == json!("tail")));
        assert!(matches!(driver.tick(), Tick::Finished(Ok(Value::Null))));
        assert!(driver.is_finished());
        assert_eq!(driver.depth(), 0);
        assert!(matches!(driver.tick(), Tick::Finished(Ok(_))));
    }

    #[test]
    fn test_suspends_until_promise_settles() {
        let promise = Promise::new();
        let mut driver = TickDriver::new(wait(promise.clone()).boxed());

        assert!(matches!(driver.tick(), Tick::Suspended));
        assert!(driver.is_suspended());
        let steps = driver.steps();
        assert!(matches!(driver.tick(), Tick::Suspended));
        assert_eq!(driver.steps(), steps);

        promise.resolve(json!(8060)).unwrap();
        assert!(!driver.is_suspended());
        assert!(matches!(driver.tick(), Tick::Finished(Ok(v)) if v == json!(8060)));
    }

    #[test]
    fn test_rejection_reaches_waiting_producer() {
        let promise = Promise::new();
        let mut driver = TickDriver::new(wait(promise.clone()).boxed());
        driver.tick();
        promise.reject(Signal::failure("refused")).unwrap();
        assert!(matches!(driver.tick(), Tick::Finished(Err(Signal::Failure(_)))));
    }

    #[test]
    fn test_child_failure_ascends_into_parent() {
        let root = iter(vec![Step::SubTask(once(|| Err(Signal::msg("bad"))).boxed())]);
        let mut driver = TickDriver::new(root.boxed());
        assert!(matches!(driver.tick(), Tick::Descended));
        assert!(matches!(driver.tick(), Tick::Ascended));
        // `iter` rethrows what it is sent.
        assert!(matches!(driver.tick(), Tick::Finished(Err(Signal::Error(_)))));
    }

    #[tokio::test]
    async fn test_run_to_end_wakes_on_settlement() {
        let promise = Promise::new();
        let remote = promise.clone();
        let root = iter(vec![
            Step::Value(json!(1)),
            Step::SubTask(wait(promise).boxed()),
        ]);
        let mut driver = TickDriver::new(root.boxed());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.resolve(json!("late")).unwrap();
        });
        let outcome = tokio::time::timeout(Duration::from_secs(5), driver.run_to_end())
            .await
            .expect("driver should wake up");
        assert!(outcome.is_ok());
    }
}
