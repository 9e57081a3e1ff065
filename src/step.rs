//! Coroutine producers and the steps they yield.
//!
//! A [`Producer`] is resumed repeatedly. Each resume returns one [`Step`]:
//! a plain value (yields control, nothing more), a nested producer to descend
//! into, a promise to suspend on, or completion with a return value. The
//! driver above sends back a [`Resume`] carrying the outcome of whatever the
//! previous step waited on.

use std::fmt;

use serde_json::Value;

use crate::error::Signal;
use crate::promise::{Promise, Settled};

/// What a producer yields on each resume.
pub enum Step {
    /// Plain value passed through to the driver; carries no semantics.
    Value(Value),
    /// Descend into a nested producer; its return value is sent back here.
    SubTask(BoxProducer),
    /// Suspend until the promise settles; its outcome is sent back here.
    Awaitable(Promise),
    /// The producer is exhausted and returns this value to its parent.
    Done(Value),
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Step::SubTask(_) => f.write_str("SubTask(..)"),
            Step::Awaitable(promise) => f.debug_tuple("Awaitable").field(promise).finish(),
            Step::Done(value) => f.debug_tuple("Done").field(value).finish(),
        }
    }
}

/// What the driver sends into a producer when resuming it.
#[derive(Debug, Clone)]
pub enum Resume {
    /// Plain advance after a `Value` step, or the first resume.
    Next,
    /// Outcome of an awaited promise or the return value of a sub-task.
    Value(Value),
    /// An awaited promise was rejected or a sub-task failed.
    Throw(Signal),
}

impl From<Settled> for Resume {
    fn from(outcome: Settled) -> Self {
        match outcome {
            Ok(value) => Resume::Value(value),
            Err(signal) => Resume::Throw(signal),
        }
    }
}

impl Resume {
    /// The sent value; a throw becomes the error.
    pub fn into_result(self) -> Result<Value, Signal> {
        match self {
            Resume::Next => Ok(Value::Null),
            Resume::Value(value) => Ok(value),
            Resume::Throw(signal) => Err(signal),
        }
    }
}

/// A resumable coroutine.
pub trait Producer: Send {
    /// Advance to the next step. Returning `Err` ends the producer with a
    /// failure, which is thrown into its parent.
    fn resume(&mut self, input: Resume) -> Result<Step, Signal>;
}

pub type BoxProducer = Box<dyn Producer>;

impl Producer for BoxProducer {
    fn resume(&mut self, input: Resume) -> Result<Step, Signal> {
        (**self).resume(input)
    }
}

/// Combinators available on every producer.
pub trait ProducerExt: Producer + Sized + 'static {
    fn boxed(self) -> BoxProducer {
        Box::new(self)
    }

    /// Run `self` to completion, then continue with the producer built from
    /// its return value.
    fn and_then<F>(self, next: F) -> AndThen<Self, F>
    where
        F: FnOnce(Value) -> Result<BoxProducer, Signal> + Send,
    {
        AndThen {
            state: AndThenState::First(self, Some(next)),
        }
    }
}

impl<P: Producer + Sized + 'static> ProducerExt for P {}

/// Producer backed by a closure acting as its state machine.
pub struct FromFn<F> {
    f: F,
}

impl<F> Producer for FromFn<F>
where
    F: FnMut(Resume) -> Result<Step, Signal> + Send,
{
    fn resume(&mut self, input: Resume) -> Result<Step, Signal> {
        (self.f)(input)
    }
}

pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: FnMut(Resume) -> Result<Step, Signal> + Send,
{
    FromFn { f }
}

/// Producer replaying a fixed sequence of steps. A throw ends it with that
/// failure.
pub struct Iter<I> {
    steps: I,
}

impl<I> Producer for Iter<I>
where
    I: Iterator<Item = Step> + Send,
{
    fn resume(&mut self, input: Resume) -> Result<Step, Signal> {
        if let Resume::Throw(signal) = input {
            return Err(signal);
        }
        Ok(self.steps.next().unwrap_or(Step::Done(Value::Null)))
    }
}

pub fn iter<I>(steps: I) -> Iter<I::IntoIter>
where
    I: IntoIterator<Item = Step>,
    I::IntoIter: Send,
{
    Iter {
        steps: steps.into_iter(),
    }
}

/// Producer that runs a closure on its first resume and returns its value.
pub struct Once<F> {
    f: Option<F>,
}

impl<F> Producer for Once<F>
where
    F: FnOnce() -> Result<Value, Signal> + Send,
{
    fn resume(&mut self, input: Resume) -> Result<Step, Signal> {
        if let Resume::Throw(signal) = input {
            return Err(signal);
        }
        match self.f.take() {
            Some(f) => f().map(Step::Done),
            None => Ok(Step::Done(Value::Null)),
        }
    }
}

pub fn once<F>(f: F) -> Once<F>
where
    F: FnOnce() -> Result<Value, Signal> + Send,
{
    Once { f: Some(f) }
}

/// Producer that suspends on a promise and returns its value.
pub struct Wait {
    promise: Promise,
    yielded: bool,
}

impl Producer for Wait {
    fn resume(&mut self, input: Resume) -> Result<Step, Signal> {
        if !self.yielded {
            if let Resume::Throw(signal) = input {
                return Err(signal);
            }
            self.yielded = true;
            return Ok(Step::Awaitable(self.promise.clone()));
        }
        match input {
            Resume::Next => match self.promise.outcome() {
                Some(outcome) => outcome.map(Step::Done),
                None => Ok(Step::Awaitable(self.promise.clone())),
            },
            other => other.into_result().map(Step::Done),
        }
    }
}

pub fn wait(promise: Promise) -> Wait {
    Wait {
        promise,
        yielded: false,
    }
}

enum AndThenState<P, F> {
    First(P, Option<F>),
    Second(BoxProducer),
}

/// See [`ProducerExt::and_then`].
pub struct AndThen<P, F> {
    state: AndThenState<P, F>,
}

impl<P, F> Producer for AndThen<P, F>
where
    P: Producer,
    F: FnOnce(Value) -> Result<BoxProducer, Signal> + Send,
{
    fn resume(&mut self, input: Resume) -> Result<Step, Signal> {
        let next = match &mut self.state {
            AndThenState::Second(second) => return second.resume(input),
            AndThenState::First(first, next) => match first.resume(input)? {
                Step::Done(value) => match next.take() {
                    Some(next) => next(value)?,
                    None => return Ok(Step::Done(value)),
                },
                step => return Ok(step),
            },
        };
        self.state = AndThenState::Second(next);
        match &mut self.state {
            AndThenState::Second(second) => second.resume(Resume::Next),
            AndThenState::First(..) => Ok(Step::Done(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(p: &mut dyn Producer) -> Vec<Value> {
        let mut out = Vec::new();
        loop {
            match p.resume(Resume::Next).unwrap() {
                Step::Value(v) => out.push(v),
                Step::Done(v) => {
                    out.push(json!({"done": v}));
                    return out;
                }
                other => panic!("unexpected step {:?}", other),
            }
        }
    }

    #[test]
    fn test_iter_replays_steps() {
        let mut p = iter(vec![Step::Value(json!(1)), Step::Value(json!(2))]);
        assert_eq!(values(&mut p), vec![json!(1), json!(2), json!({"done": null})]);
    }

    #[test]
    fn test_iter_throw_ends_with_failure() {
        let mut p = iter(vec![Step::Value(json!(1))]);
        let err = p.resume(Resume::Throw(Signal::failure("x"))).unwrap_err();
        assert!(matches!(err, Signal::Failure(_)));
    }

    #[test]
    fn test_once_returns_value() {
        let mut p = once(|| Ok(json!("v")));
        assert!(matches!(p.resume(Resume::Next).unwrap(), Step::Done(v) if v == json!("v")));
    }

    #[test]
    fn test_wait_suspends_then_returns() {
        let promise = Promise::new();
        let mut p = wait(promise.clone());
        assert!(matches!(p.resume(Resume::Next).unwrap(), Step::Awaitable(_)));
        // Still pending: ask again.
        assert!(matches!(p.resume(Resume::Next).unwrap(), Step::Awaitable(_)));
        promise.resolve(json!(5)).unwrap();
        assert!(matches!(p.resume(Resume::Value(json!(5))).unwrap(), Step::Done(v) if v == json!(5)));
    }

    #[test]
    fn test_wait_rethrows_rejection() {
        let mut p = wait(Promise::new());
        p.resume(Resume::Next).unwrap();
        let err = p.resume(Resume::Throw(Signal::skip("offline"))).unwrap_err();
        assert!(err.is_skip());
    }

    #[test]
    fn test_and_then_continues_with_return_value() {
        let mut p = once(|| Ok(json!(2))).and_then(|v| {
            let doubled = v.as_i64().unwrap_or(0) * 2;
            Ok(iter(vec![Step::Value(json!(doubled)), Step::Done(json!("end"))]).boxed())
        });
        assert_eq!(values(&mut p), vec![json!(4), json!({"done": "end"})]);
    }

    #[test]
    fn test_from_fn_state_machine() {
        let mut count = 0;
        let mut p = from_fn(move |_| {
            count += 1;
            if count < 3 {
                Ok(Step::Value(json!(count)))
            } else {
                Ok(Step::Done(json!(count)))
            }
        });
        assert_eq!(values(&mut p), vec![json!(1), json!(2), json!({"done": 3})]);
    }
}
