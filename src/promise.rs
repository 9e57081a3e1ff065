//! One-shot asynchronous value with an ordered callback chain.
//!
//! A [`Promise`] starts pending and settles exactly once, either resolved with
//! a value or rejected with a [`Signal`]. Callbacks fire synchronously on the
//! thread that settles it, in registration order. Registering on a settled
//! promise fires immediately, after any callbacks still queued.
//!
//! Sequencing is done by chaining: [`Promise::add_callbacks`] returns a derived
//! promise that settles with whatever the handler produced. A handler that
//! returns another promise postpones the derived promise until that one
//! settles.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{EngineError, EngineResult, Signal};

/// The settled outcome of a promise.
pub type Settled = Result<Value, Signal>;

type Callback = Box<dyn FnOnce(Settled) + Send>;

/// What a chained handler hands to the next link.
pub enum Chained {
    /// Settle the derived promise now with this value.
    Value(Value),
    /// Settle the derived promise when this one settles.
    Promise(Promise),
}

impl From<Value> for Chained {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Promise> for Chained {
    fn from(promise: Promise) -> Self {
        Self::Promise(promise)
    }
}

enum State {
    Pending,
    Resolved(Value),
    Failed(Signal),
}

struct Inner {
    state: State,
    callbacks: VecDeque<Callback>,
    firing: bool,
}

impl Inner {
    fn outcome(&self) -> Option<Settled> {
        match &self.state {
            State::Pending => None,
            State::Resolved(value) => Some(Ok(value.clone())),
            State::Failed(signal) => Some(Err(signal.clone())),
        }
    }
}

/// Shared handle to a one-shot result. Clones refer to the same promise.
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Mutex<Inner>>,
}

impl Promise {
    /// Create a pending promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Pending,
                callbacks: VecDeque::new(),
                firing: false,
            })),
        }
    }

    /// Create a promise already resolved with `value`.
    pub fn resolved(value: impl Into<Value>) -> Self {
        let promise = Self::new();
        promise.inner.lock().state = State::Resolved(value.into());
        promise
    }

    /// Create a promise already rejected with `signal`.
    pub fn rejected(signal: Signal) -> Self {
        let promise = Self::new();
        promise.inner.lock().state = State::Failed(signal);
        promise
    }

    /// Transition pending → resolved and fire queued callbacks.
    pub fn resolve(&self, value: impl Into<Value>) -> EngineResult<()> {
        self.settle(Ok(value.into()))
    }

    /// Transition pending → failed and fire queued callbacks.
    pub fn reject(&self, signal: Signal) -> EngineResult<()> {
        self.settle(Err(signal))
    }

    /// Settle with an outcome. Fails with [`EngineError::InvalidState`] when
    /// the promise is no longer pending.
    pub fn settle(&self, outcome: Settled) -> EngineResult<()> {
        {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, State::Pending) {
                return Err(EngineError::InvalidState(
                    "promise has already been settled".to_string(),
                ));
            }
            inner.state = match outcome {
                Ok(value) => State::Resolved(value),
                Err(signal) => State::Failed(signal),
            };
        }
        self.fire();
        Ok(())
    }

    /// Register a success/error pair and return the derived promise of this
    /// link in the chain.
    pub fn add_callbacks<S, E>(&self, on_success: S, on_error: E) -> Promise
    where
        S: FnOnce(Value) -> Result<Chained, Signal> + Send + 'static,
        E: FnOnce(Signal) -> Result<Chained, Signal> + Send + 'static,
    {
        let derived = Promise::new();
        let next = derived.clone();
        self.push(Box::new(move |outcome| {
            let step = match outcome {
                Ok(value) => on_success(value),
                Err(signal) => on_error(signal),
            };
            next.follow(step);
        }));
        derived
    }

    /// Chain a success handler; failures pass through to the derived promise.
    pub fn then<S>(&self, on_success: S) -> Promise
    where
        S: FnOnce(Value) -> Result<Chained, Signal> + Send + 'static,
    {
        self.add_callbacks(on_success, Err)
    }

    /// Chain an error handler; values pass through to the derived promise.
    pub fn catch<E>(&self, on_error: E) -> Promise
    where
        E: FnOnce(Signal) -> Result<Chained, Signal> + Send + 'static,
    {
        self.add_callbacks(|value| Ok(Chained::Value(value)), on_error)
    }

    /// Listen for the outcome without deriving a new promise.
    pub fn observe<F>(&self, listener: F)
    where
        F: FnOnce(Settled) + Send + 'static,
    {
        self.push(Box::new(listener));
    }

    /// Non-blocking: has the promise settled?
    pub fn done(&self) -> bool {
        !matches!(self.inner.lock().state, State::Pending)
    }

    /// The settled outcome, or `None` while pending.
    pub fn outcome(&self) -> Option<Settled> {
        self.inner.lock().outcome()
    }

    /// The resolved value.
    ///
    /// Fails with [`EngineError::InvalidState`] while pending and with
    /// [`EngineError::Rejected`] when the promise failed.
    pub fn result(&self) -> EngineResult<Value> {
        match &self.inner.lock().state {
            State::Pending => Err(EngineError::InvalidState(
                "result requested while the promise is pending".to_string(),
            )),
            State::Resolved(value) => Ok(value.clone()),
            State::Failed(signal) => Err(EngineError::Rejected(signal.clone())),
        }
    }

    /// The failure, `None` when resolved. Fails while pending.
    pub fn error(&self) -> EngineResult<Option<Signal>> {
        match &self.inner.lock().state {
            State::Pending => Err(EngineError::InvalidState(
                "error requested while the promise is pending".to_string(),
            )),
            State::Resolved(_) => Ok(None),
            State::Failed(signal) => Ok(Some(signal.clone())),
        }
    }

    fn follow(&self, step: Result<Chained, Signal>) {
        // `self` is a fresh derived promise settled only from here.
        match step {
            Ok(Chained::Value(value)) => {
                let _ = self.resolve(value);
            }
            Ok(Chained::Promise(inner)) => {
                let target = self.clone();
                inner.observe(move |outcome| {
                    let _ = target.settle(outcome);
                });
            }
            Err(signal) => {
                let _ = self.reject(signal);
            }
        }
    }

    fn push(&self, callback: Callback) {
        let settled = {
            let mut inner = self.inner.lock();
            inner.callbacks.push_back(callback);
            !matches!(inner.state, State::Pending)
        };
        if settled {
            self.fire();
        }
    }

    /// Drain the callback queue. Re-entrant registrations land at the back of
    /// the queue and are picked up by the loop already running.
    fn fire(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.firing {
                return;
            }
            inner.firing = true;
        }
        loop {
            let (callback, outcome) = {
                let mut inner = self.inner.lock();
                let Some(outcome) = inner.outcome() else {
                    inner.firing = false;
                    return;
                };
                match inner.callbacks.pop_front() {
                    Some(callback) => (callback, outcome),
                    None => {
                        inner.firing = false;
                        return;
                    }
                }
            };
            callback(outcome);
        }
    }
}

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        let state = match &inner.state {
            State::Pending => "pending".to_string(),
            State::Resolved(value) => format!("resolved({})", value),
            State::Failed(signal) => format!("failed({})", signal),
        };
        f.debug_struct("Promise")
            .field("state", &state)
            .field("callbacks", &inner.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |entry: &str| sink.lock().push(entry.to_string()))
    }

    #[test]
    fn test_resolve_once() {
        let p = Promise::new();
        assert!(!p.done());
        p.resolve(json!(1)).unwrap();
        assert!(p.done());
        assert_eq!(p.result().unwrap(), json!(1));
        assert!(p.error().unwrap().is_none());

        assert!(matches!(p.resolve(json!(2)), Err(EngineError::InvalidState(_))));
        assert!(matches!(p.reject(Signal::msg("late")), Err(EngineError::InvalidState(_))));
        assert_eq!(p.result().unwrap(), json!(1));
    }

    #[test]
    fn test_reading_pending_is_invalid() {
        let p = Promise::new();
        assert!(matches!(p.result(), Err(EngineError::InvalidState(_))));
        assert!(matches!(p.error(), Err(EngineError::InvalidState(_))));
        assert!(p.outcome().is_none());
    }

    #[test]
    fn test_rejected_result() {
        let p = Promise::new();
        p.reject(Signal::failure("bad")).unwrap();
        assert!(matches!(p.result(), Err(EngineError::Rejected(Signal::Failure(_)))));
        assert!(matches!(p.error().unwrap(), Some(Signal::Failure(_))));
    }

    #[test]
    fn test_callbacks_fire_in_order() {
        let (log, push) = recorder();
        let p = Promise::new();
        for name in ["a", "b", "c"] {
            let push = push.clone();
            p.observe(move |outcome| push(&format!("{}={}", name, outcome.unwrap())));
        }
        assert!(log.lock().is_empty());
        p.resolve(json!(7)).unwrap();
        assert_eq!(*log.lock(), vec!["a=7", "b=7", "c=7"]);
    }

    #[test]
    fn test_callback_on_settled_fires_immediately() {
        let (log, push) = recorder();
        let p = Promise::resolved(json!("x"));
        p.observe(move |_| push("late"));
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn test_reentrant_registration_runs_after_earlier_callbacks() {
        let (log, push) = recorder();
        let p = Promise::new();
        let again = p.clone();
        let push_inner = push.clone();
        let push_first = push.clone();
        p.observe(move |_| {
            push_first("first");
            again.observe(move |_| push_inner("nested"));
        });
        p.observe(move |_| push("second"));
        p.resolve(Value::Null).unwrap();
        assert_eq!(*log.lock(), vec!["first", "second", "nested"]);
    }

    #[test]
    fn test_then_transforms_value() {
        let p = Promise::new();
        let derived = p.then(|v| Ok(json!(v.as_i64().unwrap_or(0) * 2).into()));
        p.resolve(json!(21)).unwrap();
        assert_eq!(derived.result().unwrap(), json!(42));
    }

    #[test]
    fn test_chained_promise_defers_outcome() {
        let p = Promise::new();
        let inner = Promise::new();
        let handed = inner.clone();
        let derived = p.then(move |_| Ok(handed.into()));

        p.resolve(Value::Null).unwrap();
        assert!(!derived.done());

        inner.resolve(json!("late")).unwrap();
        assert_eq!(derived.result().unwrap(), json!("late"));
    }

    #[test]
    fn test_handler_error_reaches_next_error_handler() {
        let p = Promise::new();
        let recovered = p
            .then(|_| Err(Signal::msg("broken callback")))
            .then(|_| Ok(json!("skipped").into()))
            .catch(|signal| Ok(json!(format!("recovered: {}", signal)).into()));
        p.resolve(Value::Null).unwrap();
        assert_eq!(recovered.result().unwrap(), json!("recovered: broken callback"));
    }

    #[test]
    fn test_unhandled_callback_error_is_terminal_failure() {
        let p = Promise::new();
        let derived = p.then(|_| Err(Signal::failure("assertion")));
        p.resolve(Value::Null).unwrap();
        assert!(matches!(derived.error().unwrap(), Some(Signal::Failure(_))));
    }

    #[test]
    fn test_rejection_skips_success_handlers() {
        let (log, push) = recorder();
        let p = Promise::new();
        let derived = p.then(move |_| {
            push("success");
            Ok(Value::Null.into())
        });
        p.reject(Signal::skip("not today")).unwrap();
        assert!(log.lock().is_empty());
        assert!(matches!(derived.error().unwrap(), Some(Signal::Skip(_))));
    }

    #[test]
    fn test_settle_from_another_thread() {
        let p = Promise::new();
        let remote = p.clone();
        std::thread::spawn(move || remote.resolve(json!({"ok": true})).unwrap())
            .join()
            .unwrap();
        assert_eq!(p.result().unwrap(), json!({"ok": true}));
    }
}
