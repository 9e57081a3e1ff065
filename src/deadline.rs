//! Timer that forcibly rejects a promise.
//!
//! Promises carry no timeout of their own; a producer waiting on one that
//! never settles stalls forever. Bound such waits with [`reject_after`].

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::Signal;
use crate::promise::Promise;

/// Reject `promise` with an error if it is still pending after `timeout`.
///
/// Must be called from within a tokio runtime. Rejection happens on that
/// runtime, so callbacks fire there. Aborting the returned handle cancels
/// the deadline.
pub fn reject_after(promise: &Promise, timeout: Duration) -> JoinHandle<()> {
    let promise = promise.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if promise.done() {
            return;
        }
        let signal = Signal::msg(format!("timed out after {:.3}s", timeout.as_secs_f64()));
        if promise.reject(signal).is_ok() {
            warn!("Promise rejected after {:?} without settling", timeout);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Envelope, Mailbox, Transport};
    use crate::error::EngineResult;
    use serde_json::json;
    use std::sync::Arc;

    /// Accepts every envelope and never replies.
    struct Silent;

    impl Transport for Silent {
        fn post(&self, _envelope: Envelope) -> EngineResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rejects_pending_promise() {
        let promise = Promise::new();
        reject_after(&promise, Duration::from_millis(20)).await.unwrap();
        let err = promise.error().unwrap().unwrap();
        assert_eq!(err.to_string(), "timed out after 0.020s");
    }

    #[tokio::test]
    async fn test_settled_promise_is_left_alone() {
        let promise = Promise::new();
        let deadline = reject_after(&promise, Duration::from_millis(20));
        promise.resolve(json!("in time")).unwrap();
        deadline.await.unwrap();
        assert_eq!(promise.result().unwrap(), json!("in time"));
    }

    #[tokio::test]
    async fn test_timed_out_request_leaves_mailbox() {
        let (mailbox, _inbox) = Mailbox::new("worker", Arc::new(Silent));
        let request = mailbox.run("arbiter", "echo", vec![json!(1)]);
        assert_eq!(mailbox.in_flight(), 1);

        reject_after(&request, Duration::from_millis(20)).await.unwrap();
        assert!(request.error().unwrap().is_some());
        assert_eq!(mailbox.in_flight(), 0);
    }
}
