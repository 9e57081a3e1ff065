//! Explicit frame stack flattening nested producers.
//!
//! [`Frames::advance`] keeps descending into sub-tasks and popping finished
//! frames until something the caller must see comes up: a plain value, a
//! promise to suspend on, or the end of the outermost producer. Whatever the
//! nesting depth, the caller observes one flat sequence.

use serde_json::Value;

use crate::error::Signal;
use crate::promise::Promise;
use crate::step::{BoxProducer, Resume, Step};

/// What a frame stack surfaces to its caller.
#[derive(Debug)]
pub enum Emit {
    Value(Value),
    Awaitable(Promise),
    /// The outermost producer returned.
    Finished(Value),
}

/// A current producer plus the suspended parents above it.
#[derive(Default)]
pub struct Frames {
    current: Option<BoxProducer>,
    stack: Vec<BoxProducer>,
}

impl Frames {
    pub fn new(root: BoxProducer) -> Self {
        Self {
            current: Some(root),
            stack: Vec::new(),
        }
    }

    /// Number of live frames, the current one included.
    pub fn depth(&self) -> usize {
        self.stack.len() + usize::from(self.current.is_some())
    }

    pub fn is_finished(&self) -> bool {
        self.current.is_none()
    }

    /// Resume the innermost producer with `input` and run until the next
    /// caller-visible event.
    ///
    /// A sub-task's return value is sent to its parent; a sub-task failure is
    /// thrown into its parent. Only the outermost failure is returned.
    pub fn advance(&mut self, input: Resume) -> Result<Emit, Signal> {
        let mut input = input;
        loop {
            let Some(current) = self.current.as_mut() else {
                return Ok(Emit::Finished(Value::Null));
            };
            match current.resume(input) {
                Ok(Step::Value(value)) => return Ok(Emit::Value(value)),
                Ok(Step::Awaitable(promise)) => return Ok(Emit::Awaitable(promise)),
                Ok(Step::SubTask(child)) => {
                    if let Some(parent) = self.current.replace(child) {
                        self.stack.push(parent);
                    }
                    input = Resume::Next;
                }
                Ok(Step::Done(value)) => {
                    self.current = self.stack.pop();
                    if self.current.is_none() {
                        return Ok(Emit::Finished(value));
                    }
                    input = Resume::Value(value);
                }
                Err(signal) => {
                    self.current = self.stack.pop();
                    if self.current.is_none() {
                        return Err(signal);
                    }
                    input = Resume::Throw(signal);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{ProducerExt, from_fn, iter, once, wait};
    use proptest::prelude::*;
    use serde_json::json;

    /// Wrap `leaves` in `depth` levels of single-child producers, splitting
    /// the leaves between a prefix, the nested child and a suffix.
    fn nested(leaves: Vec<i64>, depth: usize) -> BoxProducer {
        if depth == 0 || leaves.len() < 2 {
            return iter(leaves.into_iter().map(|v| Step::Value(json!(v)))).boxed();
        }
        let mid = leaves.len() / 2;
        let (head, rest) = leaves.split_at(1);
        let (inner, tail) = rest.split_at(mid.saturating_sub(1).min(rest.len()));
        let mut steps: Vec<Step> = head.iter().map(|v| Step::Value(json!(v))).collect();
        steps.push(Step::SubTask(nested(inner.to_vec(), depth - 1)));
        steps.extend(tail.iter().map(|v| Step::Value(json!(v))));
        iter(steps).boxed()
    }

    fn drain(frames: &mut Frames) -> Result<Vec<Value>, Signal> {
        let mut out = Vec::new();
        loop {
            match frames.advance(Resume::Next)? {
                Emit::Value(v) => out.push(v),
                Emit::Finished(_) => return Ok(out),
                Emit::Awaitable(p) => panic!("unexpected await on {:?}", p),
            }
        }
    }

    proptest! {
        #[test]
        fn prop_nesting_preserves_leaf_sequence(
            leaves in proptest::collection::vec(any::<i64>(), 0..40),
            depth in 0usize..8,
        ) {
            let mut frames = Frames::new(nested(leaves.clone(), depth));
            let flat = drain(&mut frames).unwrap();
            let expected: Vec<Value> = leaves.iter().map(|v| json!(v)).collect();
            prop_assert_eq!(flat, expected);
            prop_assert!(frames.is_finished());
        }
    }

    #[test]
    fn test_sub_task_return_value_reaches_parent() {
        let parent = from_fn({
            let mut started = false;
            move |input| {
                if !started {
                    started = true;
                    return Ok(Step::SubTask(once(|| Ok(json!(41))).boxed()));
                }
                let v = input.into_result()?;
                Ok(Step::Done(json!(v.as_i64().unwrap_or(0) + 1)))
            }
        });
        let mut frames = Frames::new(parent.boxed());
        assert!(matches!(frames.advance(Resume::Next).unwrap(), Emit::Finished(v) if v == json!(42)));
    }

    #[test]
    fn test_child_failure_is_thrown_into_parent() {
        let child = once(|| Err(Signal::failure("inner")));
        let parent = iter(vec![Step::SubTask(child.boxed()), Step::Value(json!("never"))]);
        let mut frames = Frames::new(parent.boxed());
        let err = frames.advance(Resume::Next).unwrap_err();
        assert!(matches!(err, Signal::Failure(ref m) if m == "inner"));
        assert!(frames.is_finished());
    }

    #[test]
    fn test_parent_can_recover_from_child_failure() {
        let parent = from_fn({
            let mut started = false;
            move |input| {
                if !started {
                    started = true;
                    return Ok(Step::SubTask(once(|| Err(Signal::msg("boom"))).boxed()));
                }
                match input {
                    Resume::Throw(signal) => Ok(Step::Done(json!(format!("caught {}", signal)))),
                    _ => Ok(Step::Done(json!("no error"))),
                }
            }
        });
        let mut frames = Frames::new(parent.boxed());
        assert!(matches!(
            frames.advance(Resume::Next).unwrap(),
            Emit::Finished(v) if v == json!("caught boom")
        ));
    }

    #[test]
    fn test_awaitable_surfaces_from_depth() {
        let promise = Promise::new();
        let deep = iter(vec![Step::SubTask(
            iter(vec![Step::SubTask(wait(promise.clone()).boxed())]).boxed(),
        )]);
        let mut frames = Frames::new(deep.boxed());
        assert!(matches!(frames.advance(Resume::Next).unwrap(), Emit::Awaitable(_)));
        assert_eq!(frames.depth(), 3);

        promise.resolve(json!("x")).unwrap();
        assert!(matches!(
            frames.advance(Resume::Value(json!("x"))).unwrap(),
            Emit::Finished(_)
        ));
        assert_eq!(frames.depth(), 0);
    }
}
