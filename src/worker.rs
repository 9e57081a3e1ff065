//! Per-thread host loop running an [`Application`].
//!
//! Each iteration delivers the replies that arrived since the last one, then
//! calls [`Application::worker_task`] once. A task that has nothing to do
//! until something settles parks the worker; it sleeps until the wake
//! notifier fires or a reply arrives.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info};

use crate::actor::{Mailbox, Reply};
use crate::types::ActorName;

/// Optional hooks of a runnable application. Absent hooks do nothing.
pub trait Application: Send {
    fn name(&self) -> &str;

    /// Receive configuration options before the worker starts.
    fn load_config(&mut self, _options: &Map<String, Value>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the worker starts.
    fn configure_logging(&mut self) {}

    /// Called once per tick. The default parks the worker.
    fn worker_task(&mut self, worker: &mut Worker) -> anyhow::Result<()> {
        worker.park();
        Ok(())
    }
}

pub struct Worker {
    mailbox: Mailbox,
    inbox: mpsc::UnboundedReceiver<Reply>,
    wake: Arc<Notify>,
    parked: bool,
    stopping: bool,
    ticks: u64,
}

impl Worker {
    pub fn new(mailbox: Mailbox, inbox: mpsc::UnboundedReceiver<Reply>) -> Self {
        Self {
            mailbox,
            inbox,
            wake: Arc::new(Notify::new()),
            parked: false,
            stopping: false,
            ticks: 0,
        }
    }

    pub fn name(&self) -> &ActorName {
        self.mailbox.owner()
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Notifier that unparks this worker.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Skip calling `worker_task` until woken.
    pub fn park(&mut self) {
        self.parked = true;
    }

    /// Stop after the current tick.
    pub fn shut_down(&mut self) {
        self.stopping = true;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    fn drain_inbox(&mut self) {
        while let Ok(reply) = self.inbox.try_recv() {
            self.mailbox.deliver(reply);
        }
    }

    pub async fn run<A: Application + ?Sized>(mut self, app: &mut A) -> anyhow::Result<()> {
        app.configure_logging();
        info!("Worker {} started for {}", self.name(), app.name());

        while !self.stopping {
            self.drain_inbox();
            if self.parked {
                tokio::select! {
                    _ = self.wake.notified() => {}
                    reply = self.inbox.recv() => {
                        if let Some(reply) = reply {
                            self.mailbox.deliver(reply);
                        }
                    }
                }
                self.parked = false;
                continue;
            }
            app.worker_task(&mut self)?;
            self.ticks += 1;
            tokio::task::yield_now().await;
        }

        debug!("Worker {} stopping, {} requests in flight", self.name(), self.mailbox.in_flight());
        info!("Worker {} stopped after {} ticks", self.name(), self.ticks);
        Ok(())
    }
}
