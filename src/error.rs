//! Error types for the engine.
//!
//! Two families live here:
//! - [`EngineError`]: misuse of the primitives themselves (settling a promise
//!   twice, mutating a locked gather) and failures of the collaborators
//!   around them (registry, transport, configuration).
//! - [`Signal`]: what a step, a hook or a rejected promise reports. The
//!   scheduler classifies it into an [`Outcome`](crate::report::Outcome).

use std::sync::Arc;

use crate::report::Outcome;

/// Errors raised by the engine primitives and their collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The operation is not allowed in the current state, e.g. resolving a
    /// settled promise or reading the result of a pending one.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A gather was mutated or locked after it had been locked.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The promise settled with a failure.
    #[error("rejected: {0}")]
    Rejected(Signal),

    /// A module or function name is unknown to the registry.
    #[error("{0} is not registered, please make sure it is registered at startup")]
    NotRegistered(String),

    /// The transport could not deliver a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// The requested mode or feature is not available here.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Invalid run configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// The failure classification carried by a step or a rejected promise.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Signal {
    /// Non-fatal: the unit is recorded as skipped.
    #[error("skipped: {0}")]
    Skip(String),

    /// An expectation was violated inside a body.
    #[error("{0}")]
    Failure(String),

    /// Anything else.
    #[error("{0:#}")]
    Error(Arc<anyhow::Error>),
}

impl Signal {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }

    pub fn error(err: impl Into<anyhow::Error>) -> Self {
        Self::Error(Arc::new(err.into()))
    }

    /// Build an error signal from a plain message.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Error(Arc::new(anyhow::anyhow!("{}", message)))
    }

    /// Map this signal onto the outcome it produces for an execution unit.
    pub fn classify(&self) -> Outcome {
        match self {
            Self::Skip(_) => Outcome::Skipped,
            Self::Failure(_) => Outcome::Failure,
            Self::Error(_) => Outcome::Error,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip(_))
    }
}

impl From<EngineError> for Signal {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Rejected(signal) => signal,
            other => Signal::error(other),
        }
    }
}

impl From<anyhow::Error> for Signal {
    fn from(err: anyhow::Error) -> Self {
        Self::Error(Arc::new(err))
    }
}

/// Fail the current step with [`Signal::Failure`] unless `cond` holds.
///
/// ```ignore
/// ensure_that!(status == 200, "unexpected status {}", status);
/// ```
#[macro_export]
macro_rules! ensure_that {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Signal::Failure(format!($($arg)+)));
        }
    };
}

/// Fail the current step with [`Signal::Failure`] unless both sides are equal.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {
        match (&$left, &$right) {
            (l, r) => {
                if l != r {
                    return Err($crate::Signal::Failure(format!("{:?} != {:?}", l, r)));
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(Signal::skip("later").classify(), Outcome::Skipped);
        assert_eq!(Signal::failure("1 != 2").classify(), Outcome::Failure);
        assert_eq!(Signal::msg("boom").classify(), Outcome::Error);
    }

    #[test]
    fn test_rejected_engine_error_unwraps_signal() {
        let signal: Signal = EngineError::Rejected(Signal::failure("nope")).into();
        assert!(matches!(signal, Signal::Failure(ref m) if m == "nope"));

        let signal: Signal = EngineError::InvalidState("pending".into()).into();
        assert_eq!(signal.classify(), Outcome::Error);
        assert!(signal.to_string().contains("invalid state"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Signal::skip("no db").to_string(), "skipped: no db");
        assert_eq!(Signal::failure("1 != 2").to_string(), "1 != 2");
        assert_eq!(
            EngineError::NotRegistered("apps.chat.tests".into()).to_string(),
            "apps.chat.tests is not registered, please make sure it is registered at startup"
        );
    }

    fn check(value: i32) -> Result<(), Signal> {
        crate::ensure_that!(value > 0, "value {} is not positive", value);
        crate::ensure_eq!(value, 1);
        Ok(())
    }

    #[test]
    fn test_ensure_macros() {
        assert!(check(1).is_ok());
        assert!(matches!(check(-1), Err(Signal::Failure(m)) if m == "value -1 is not positive"));
        assert!(matches!(check(2), Err(Signal::Failure(m)) if m == "2 != 1"));
    }
}
