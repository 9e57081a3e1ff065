//! Actor messaging facade.
//!
//! A [`Mailbox`] turns a request to another actor into a [`Promise`]. The
//! envelope is handed to a [`Transport`], and the matching [`Reply`] comes
//! back on the sender's own inbox. The worker loop calls
//! [`Mailbox::deliver`], so promise callbacks always fire on the worker
//! that sent the request.
//!
//! The producer tree above never sees the transport: it only yields the
//! returned promises as suspension points.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, Signal};
use crate::promise::{Promise, Settled};
use crate::types::{ActorName, AppName, ExecutionId};

/// Address of the supervising actor.
pub const ARBITER: &str = "arbiter";

/// Requests understood by the supervising actor.
#[derive(Debug, Clone)]
pub enum Command {
    /// Execute a named function inside the target actor.
    Run { function: String, args: Vec<Value> },
    /// Terminate a named actor.
    KillActor { name: AppName },
    /// Look up a running application.
    GetApplication { name: AppName },
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::Run { .. } => "run",
            Command::KillActor { .. } => "kill_actor",
            Command::GetApplication { .. } => "get_application",
        }
    }
}

/// A request in flight.
#[derive(Debug)]
pub struct Envelope {
    pub id: Uuid,
    pub sender: ActorName,
    pub target: ActorName,
    pub command: Command,
    pub reply_to: mpsc::UnboundedSender<Reply>,
}

impl Envelope {
    /// Answer this envelope. A sender that went away is logged and ignored.
    pub fn reply(&self, outcome: Settled) {
        let reply = Reply {
            id: self.id,
            outcome,
        };
        if self.reply_to.send(reply).is_err() {
            debug!("Sender {} is gone, dropping reply {}", self.sender, self.id);
        }
    }
}

/// The answer to an [`Envelope`].
#[derive(Debug)]
pub struct Reply {
    pub id: Uuid,
    pub outcome: Settled,
}

/// Boundary to whatever physically moves envelopes between actors.
pub trait Transport: Send + Sync {
    fn post(&self, envelope: Envelope) -> EngineResult<()>;
}

/// Boundary a spawned application runs behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    #[default]
    Thread,
    Process,
}

impl IsolationMode {
    pub fn from_thread_flag(use_thread_isolation: bool) -> Self {
        if use_thread_isolation {
            Self::Thread
        } else {
            Self::Process
        }
    }
}

/// What `get_application` resolves with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationHandle {
    pub name: AppName,
    pub address: SocketAddr,
    /// Immutable configuration snapshot taken when the application started.
    pub cfg: Map<String, Value>,
}

impl ApplicationHandle {
    /// Build a handle, stamping a fresh execution id into `cfg` unless one
    /// is already present.
    pub fn new(name: impl Into<AppName>, address: SocketAddr, mut cfg: Map<String, Value>) -> Self {
        if !cfg.contains_key("exc_id") {
            cfg.insert(
                "exc_id".to_string(),
                Value::String(ExecutionId::generate().into_inner()),
            );
        }
        Self {
            name: name.into(),
            address,
            cfg,
        }
    }

    pub fn exc_id(&self) -> Option<&str> {
        self.cfg.get("exc_id").and_then(Value::as_str)
    }

    /// Decode the value a `get_application` promise resolved with. `null`
    /// means no such application.
    pub fn from_value(value: Value) -> EngineResult<Option<Self>> {
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| EngineError::Transport(format!("malformed application handle: {}", e)))
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "address": self.address.to_string(),
            "cfg": self.cfg,
        })
    }
}

/// Request side of an actor: sends envelopes and keeps the promises waiting
/// for their replies.
#[derive(Clone)]
pub struct Mailbox {
    owner: ActorName,
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<HashMap<Uuid, Promise>>>,
    reply_tx: mpsc::UnboundedSender<Reply>,
}

impl Mailbox {
    /// Create a mailbox plus the inbox its replies arrive on.
    pub fn new(
        owner: impl Into<ActorName>,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let mailbox = Self {
            owner: owner.into(),
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            reply_tx,
        };
        (mailbox, reply_rx)
    }

    pub fn owner(&self) -> &ActorName {
        &self.owner
    }

    /// Send `command` to `target`. The promise resolves with the remote
    /// return value or rejects with the remote failure.
    pub fn send(&self, target: impl Into<ActorName>, command: Command) -> Promise {
        let promise = Promise::new();
        let id = Uuid::new_v4();
        let target = target.into();
        debug!("{} -> {}: {} ({})", self.owner, target, command.label(), id);
        self.pending.lock().insert(id, promise.clone());
        // Settled by anything other than a reply, e.g. a deadline.
        let pending: Weak<Mutex<HashMap<Uuid, Promise>>> = Arc::downgrade(&self.pending);
        promise.observe(move |_| {
            if let Some(pending) = pending.upgrade() {
                pending.lock().remove(&id);
            }
        });

        let envelope = Envelope {
            id,
            sender: self.owner.clone(),
            target,
            command,
            reply_to: self.reply_tx.clone(),
        };
        if let Err(e) = self.transport.post(envelope) {
            warn!("Could not post request {}: {}", id, e);
            self.pending.lock().remove(&id);
            let _ = promise.reject(e.into());
        }
        promise
    }

    /// Execute `function` inside `target`.
    pub fn run(&self, target: impl Into<ActorName>, function: &str, args: Vec<Value>) -> Promise {
        self.send(
            target,
            Command::Run {
                function: function.to_string(),
                args,
            },
        )
    }

    /// Ask the arbiter to terminate `name`. Resolves with whether it was
    /// running.
    pub fn kill_actor(&self, name: impl Into<AppName>) -> Promise {
        self.send(ARBITER, Command::KillActor { name: name.into() })
    }

    /// Resolves with the serialized [`ApplicationHandle`], or `null`.
    pub fn get_application(&self, name: impl Into<AppName>) -> Promise {
        self.send(ARBITER, Command::GetApplication { name: name.into() })
    }

    /// Settle the promise waiting for `reply`. Returns false for replies
    /// nobody is waiting for.
    pub fn deliver(&self, reply: Reply) -> bool {
        let Some(promise) = self.pending.lock().remove(&reply.id) else {
            warn!("{} received a reply nobody waits for {}", self.owner, reply.id);
            return false;
        };
        if let Err(e) = promise.settle(reply.outcome) {
            warn!("Reply {} arrived for a settled request: {}", reply.id, e);
        }
        true
    }

    /// Requests still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}
