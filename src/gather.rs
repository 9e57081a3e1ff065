//! Shape-preserving join over literal values and promises.
//!
//! A [`Gather`] collects members while unlocked, then resolves once it is
//! locked and every member promise has settled. The result mirrors how the
//! gather was built: an ordered list, or a key → value mapping. Positions
//! follow insertion order, never completion order. Nested collections are
//! wrapped as child gathers and surface fully materialized at their slot.
//!
//! The first member failure rejects the whole gather (fail-fast); later
//! member failures are ignored.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{EngineError, EngineResult, Signal};
use crate::promise::{Promise, Settled};

/// A member handed to a gather.
#[derive(Debug)]
pub enum Member {
    /// Literal value, copied into the result as is.
    Value(Value),
    /// Pending or settled promise; its value lands in the slot.
    Promise(Promise),
    /// Nested ordered collection, joined by a child gather.
    List(Vec<Member>),
    /// Nested mapping, joined by a child gather.
    Map(Vec<(String, Member)>),
}

impl From<Value> for Member {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => Member::List(items.into_iter().map(Member::from).collect()),
            Value::Object(entries) => Member::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Member::from(value)))
                    .collect(),
            ),
            other => Member::Value(other),
        }
    }
}

impl From<Promise> for Member {
    fn from(promise: Promise) -> Self {
        Member::Promise(promise)
    }
}

impl From<&str> for Member {
    fn from(value: &str) -> Self {
        Member::Value(Value::String(value.to_string()))
    }
}

impl<T: Into<Member>> From<Vec<T>> for Member {
    fn from(items: Vec<T>) -> Self {
        Member::List(items.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    List,
    Map,
}

enum Slot {
    Ready(Value),
    Waiting,
}

struct State {
    shape: Shape,
    slots: Vec<(Option<String>, Slot)>,
    locked: bool,
    pending: usize,
    failure: Option<Signal>,
    settled: bool,
}

impl State {
    /// Decide whether the gather can settle now. Marks it settled if so.
    fn take_completion(&mut self) -> Option<Settled> {
        if !self.locked || self.settled {
            return None;
        }
        if let Some(signal) = self.failure.clone() {
            self.settled = true;
            return Some(Err(signal));
        }
        if self.pending == 0 {
            self.settled = true;
            return Some(Ok(self.materialize()));
        }
        None
    }

    fn materialize(&self) -> Value {
        let values = self.slots.iter().map(|(key, slot)| {
            let value = match slot {
                Slot::Ready(value) => value.clone(),
                Slot::Waiting => Value::Null,
            };
            (key.clone(), value)
        });
        match self.shape {
            Shape::List => Value::Array(values.map(|(_, value)| value).collect()),
            Shape::Map => {
                let mut map = Map::new();
                for (key, value) in values {
                    map.insert(key.unwrap_or_default(), value);
                }
                Value::Object(map)
            }
        }
    }
}

/// Structural join. Clones share the same underlying gather.
#[derive(Clone)]
pub struct Gather {
    state: Arc<Mutex<State>>,
    promise: Promise,
}

impl Gather {
    /// An unlocked gather producing an ordered list.
    pub fn list() -> Self {
        Self::with_shape(Shape::List)
    }

    /// An unlocked gather producing a key → value mapping.
    pub fn map() -> Self {
        Self::with_shape(Shape::Map)
    }

    fn with_shape(shape: Shape) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                shape,
                slots: Vec::new(),
                locked: false,
                pending: 0,
                failure: None,
                settled: false,
            })),
            promise: Promise::new(),
        }
    }

    /// Append a member to a list gather.
    pub fn append(&self, item: impl Into<Member>) -> EngineResult<&Self> {
        self.expect_shape(Shape::List, "append")?;
        self.push_slot(None, item.into())?;
        Ok(self)
    }

    /// Append every item, in iteration order.
    pub fn update<I>(&self, items: I) -> EngineResult<&Self>
    where
        I: IntoIterator,
        I::Item: Into<Member>,
    {
        for item in items {
            self.append(item)?;
        }
        Ok(self)
    }

    /// Insert a keyed member into a mapping gather. Keys must be unique.
    pub fn insert(&self, key: impl Into<String>, item: impl Into<Member>) -> EngineResult<&Self> {
        self.expect_shape(Shape::Map, "insert")?;
        let key = key.into();
        if self
            .state
            .lock()
            .slots
            .iter()
            .any(|(existing, _)| existing.as_deref() == Some(key.as_str()))
        {
            return Err(EngineError::ProtocolViolation(format!(
                "key `{}` is already present in the gather",
                key
            )));
        }
        self.push_slot(Some(key), item.into())?;
        Ok(self)
    }

    /// Insert every entry, in iteration order.
    pub fn update_entries<I, K, M>(&self, entries: I) -> EngineResult<&Self>
    where
        I: IntoIterator<Item = (K, M)>,
        K: Into<String>,
        M: Into<Member>,
    {
        for (key, item) in entries {
            self.insert(key, item)?;
        }
        Ok(self)
    }

    /// Freeze membership and return the joined promise.
    ///
    /// Resolves immediately when no member is pending.
    pub fn lock(&self) -> EngineResult<Promise> {
        let completion = {
            let mut state = self.state.lock();
            if state.locked {
                return Err(EngineError::ProtocolViolation(
                    "gather is already locked".to_string(),
                ));
            }
            state.locked = true;
            state.take_completion()
        };
        if let Some(outcome) = completion {
            let _ = self.promise.settle(outcome);
        }
        Ok(self.promise.clone())
    }

    pub fn locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn done(&self) -> bool {
        self.promise.done()
    }

    /// Number of members appended so far.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The joined promise. It only settles after [`Gather::lock`].
    pub fn promise(&self) -> Promise {
        self.promise.clone()
    }

    /// The joined value. Fails with [`EngineError::InvalidState`] while the
    /// gather is unlocked or still waiting on members.
    pub fn result(&self) -> EngineResult<Value> {
        if !self.locked() {
            return Err(EngineError::InvalidState(
                "gather result requested before lock".to_string(),
            ));
        }
        self.promise.result()
    }

    fn expect_shape(&self, shape: Shape, op: &str) -> EngineResult<()> {
        let actual = self.state.lock().shape;
        if actual != shape {
            return Err(EngineError::ProtocolViolation(format!(
                "`{}` is not available on a {:?} gather",
                op, actual
            )));
        }
        Ok(())
    }

    fn push_slot(&self, key: Option<String>, member: Member) -> EngineResult<()> {
        if self.locked() {
            return Err(EngineError::ProtocolViolation(
                "cannot add members to a locked gather".to_string(),
            ));
        }

        let waiting = match member {
            Member::Value(value) => {
                let mut state = self.state.lock();
                if state.locked {
                    return Err(EngineError::ProtocolViolation(
                        "cannot add members to a locked gather".to_string(),
                    ));
                }
                state.slots.push((key, Slot::Ready(value)));
                return Ok(());
            }
            Member::Promise(promise) => promise,
            Member::List(items) => child(Shape::List, items.into_iter().map(|m| (None, m))),
            Member::Map(entries) => child(
                Shape::Map,
                entries.into_iter().map(|(key, m)| (Some(key), m)),
            ),
        };

        let index = {
            let mut state = self.state.lock();
            if state.locked {
                return Err(EngineError::ProtocolViolation(
                    "cannot add members to a locked gather".to_string(),
                ));
            }
            state.slots.push((key, Slot::Waiting));
            state.pending += 1;
            state.slots.len() - 1
        };

        let state = self.state.clone();
        let joined = self.promise.clone();
        waiting.observe(move |outcome| member_settled(&state, &joined, index, outcome));
        Ok(())
    }
}

impl std::fmt::Debug for Gather {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Gather")
            .field("shape", &state.shape)
            .field("members", &state.slots.len())
            .field("pending", &state.pending)
            .field("locked", &state.locked)
            .finish()
    }
}

fn member_settled(state: &Mutex<State>, joined: &Promise, index: usize, outcome: Settled) {
    let completion = {
        let mut state = state.lock();
        if state.settled {
            return;
        }
        match outcome {
            Ok(value) => {
                if let Some(slot) = state.slots.get_mut(index) {
                    slot.1 = Slot::Ready(value);
                }
                state.pending = state.pending.saturating_sub(1);
            }
            Err(signal) => {
                if state.failure.is_some() {
                    debug!("Ignoring failure of gather member {}: {}", index, signal);
                    return;
                }
                state.failure = Some(signal);
            }
        }
        state.take_completion()
    };
    if let Some(outcome) = completion {
        let _ = joined.settle(outcome);
    }
}

/// Build and lock a child gather for a nested collection.
fn child<I>(shape: Shape, entries: I) -> Promise
where
    I: Iterator<Item = (Option<String>, Member)>,
{
    let gather = Gather::with_shape(shape);
    let built = entries
        .into_iter()
        .try_for_each(|(key, member)| match key {
            Some(key) => gather.insert(key, member).map(|_| ()),
            None => gather.append(member).map(|_| ()),
        })
        .and_then(|_| gather.lock());
    match built {
        Ok(promise) => promise,
        Err(err) => Promise::rejected(err.into()),
    }
}

/// Join `items` into a locked list gather and return its promise.
pub fn gather<I>(items: I) -> Promise
where
    I: IntoIterator,
    I::Item: Into<Member>,
{
    child(Shape::List, items.into_iter().map(|item| (None, item.into())))
}

/// Join keyed `entries` into a locked mapping gather and return its promise.
pub fn gather_map<I, K, M>(entries: I) -> Promise
where
    I: IntoIterator<Item = (K, M)>,
    K: Into<String>,
    M: Into<Member>,
{
    child(
        Shape::Map,
        entries
            .into_iter()
            .map(|(key, item)| (Some(key.into()), item.into())),
    )
}
