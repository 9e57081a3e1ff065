//! In-process supervising actor.
//!
//! The arbiter runs as a task on the caller's runtime and serves envelopes
//! posted through its [`Transport`] impl: `run` calls a registered function
//! against the arbiter state, `get_application` and `kill_actor` look up and
//! stop hosted applications. It also spawns workers, each on a dedicated
//! thread with its own current-thread runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actor::{
    ARBITER, ApplicationHandle, Command, Envelope, IsolationMode, Mailbox, Reply, Transport,
};
use crate::error::{EngineError, EngineResult, Signal};
use crate::types::{ActorName, AppName};
use crate::worker::{Application, Worker};

/// A function the arbiter executes on `run`.
pub type ArbiterFn = Arc<dyn Fn(&mut ArbiterState, Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

/// Functions callable through `run`, by name.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<String, ArbiterFn>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut ArbiterState, Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn get(&self, name: &str) -> EngineResult<ArbiterFn> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotRegistered(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Applications hosted by the arbiter.
#[derive(Debug, Default)]
pub struct ArbiterState {
    applications: BTreeMap<AppName, ApplicationHandle>,
}

impl ArbiterState {
    pub fn start_application(&mut self, handle: ApplicationHandle) -> EngineResult<()> {
        if self.applications.contains_key(&handle.name) {
            return Err(EngineError::InvalidState(format!(
                "application {} is already running",
                handle.name
            )));
        }
        info!("Application {} listening on {}", handle.name, handle.address);
        self.applications.insert(handle.name.clone(), handle);
        Ok(())
    }

    pub fn application(&self, name: &str) -> Option<&ApplicationHandle> {
        self.applications.get(name)
    }

    /// Returns whether the application was running.
    pub fn stop_application(&mut self, name: &str) -> bool {
        let stopped = self.applications.remove(name).is_some();
        if stopped {
            info!("Application {} stopped", name);
        }
        stopped
    }

    pub fn application_names(&self) -> Vec<AppName> {
        self.applications.keys().cloned().collect()
    }
}

/// Handle to the running arbiter. Clones post to the same task.
#[derive(Clone)]
pub struct Arbiter {
    tx: mpsc::UnboundedSender<Envelope>,
    stop: Arc<Notify>,
}

impl Arbiter {
    /// Start serving on the current runtime. The join handle yields the
    /// final state once [`Arbiter::stop`] is called.
    pub fn spawn(functions: FunctionTable) -> (Self, JoinHandle<ArbiterState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(serve(rx, stop.clone(), functions));
        (Self { tx, stop }, task)
    }

    pub fn stop(&self) {
        self.stop.notify_one();
    }

    /// A mailbox whose requests go to this arbiter.
    pub fn mailbox(&self, owner: impl Into<ActorName>) -> (Mailbox, mpsc::UnboundedReceiver<Reply>) {
        Mailbox::new(owner, Arc::new(self.clone()))
    }

    /// Run `app` in its own worker. `options` are handed to
    /// [`Application::load_config`] before the worker loop starts.
    pub fn spawn_worker<A>(
        &self,
        name: impl Into<ActorName>,
        app: A,
        mode: IsolationMode,
        options: Map<String, Value>,
    ) -> EngineResult<WorkerHandle>
    where
        A: Application + 'static,
    {
        if mode == IsolationMode::Process {
            return Err(EngineError::Unsupported(
                "process isolation requires an external transport".to_string(),
            ));
        }
        let name = name.into();
        let (mailbox, inbox) = self.mailbox(name.clone());
        let mut app = app;
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || -> anyhow::Result<()> {
                app.load_config(&options)?;
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(Worker::new(mailbox, inbox).run(&mut app))
            })
            .map_err(|e| EngineError::Transport(format!("could not spawn worker {}: {}", name, e)))?;
        debug!("Spawned worker {}", name);
        Ok(WorkerHandle { name, thread })
    }
}

impl Transport for Arbiter {
    fn post(&self, envelope: Envelope) -> EngineResult<()> {
        self.tx
            .send(envelope)
            .map_err(|_| EngineError::Transport("arbiter is not running".to_string()))
    }
}

async fn serve(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    stop: Arc<Notify>,
    functions: FunctionTable,
) -> ArbiterState {
    let mut state = ArbiterState::default();
    info!("Arbiter started with functions {:?}", functions.names());
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            envelope = rx.recv() => match envelope {
                Some(envelope) => handle(&mut state, &functions, envelope),
                None => break,
            },
        }
    }
    for name in state.application_names() {
        warn!("Application {} still running when the arbiter stopped", name);
    }
    info!("Arbiter stopped");
    state
}

fn handle(state: &mut ArbiterState, functions: &FunctionTable, envelope: Envelope) {
    debug!(
        "Arbiter received {} from {}",
        envelope.command.label(),
        envelope.sender
    );
    let outcome: Result<Value, Signal> = match &envelope.command {
        Command::Run { function, args } => {
            let target = envelope.target.as_str();
            if target != ARBITER && state.application(target).is_none() {
                Err(EngineError::Transport(format!("no actor named {}", target)).into())
            } else {
                match functions.get(function) {
                    Ok(f) => f(state, args.clone()).map_err(into_signal),
                    Err(e) => Err(e.into()),
                }
            }
        }
        Command::KillActor { name } => Ok(Value::Bool(state.stop_application(name.as_str()))),
        Command::GetApplication { name } => Ok(state
            .application(name.as_str())
            .map(ApplicationHandle::to_value)
            .unwrap_or(Value::Null)),
    };
    envelope.reply(outcome);
}

/// Keep a [`Signal`] raised inside a function; wrap anything else.
fn into_signal(err: anyhow::Error) -> Signal {
    match err.downcast::<Signal>() {
        Ok(signal) => signal,
        Err(err) => Signal::from(err),
    }
}

/// A worker running on its own thread.
pub struct WorkerHandle {
    name: ActorName,
    thread: std::thread::JoinHandle<anyhow::Result<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &ActorName {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the worker to stop without blocking the runtime.
    pub async fn join(self) -> anyhow::Result<()> {
        let name = self.name;
        let thread = self.thread;
        tokio::task::spawn_blocking(move || thread.join())
            .await?
            .map_err(|_| anyhow::anyhow!("worker {} panicked", name))?
    }
}
