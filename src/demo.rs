//! Built-in suites and arbiter functions used by the `steprun` binary.
//!
//! Modules (for the default `regression` kind):
//! - `regression.calculator`: plain synchronous units.
//! - `regression.echo`: starts an application through the arbiter in
//!   `init_tests`, checks its handle, exchanges messages, and kills it in
//!   `end_tests`.
//! - `regression.multi`: joins promises with [`gather`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::Mutex;
use serde_json::{Map, Value, json};

use crate::actor::{ARBITER, ApplicationHandle, Mailbox};
use crate::arbiter::FunctionTable;
use crate::error::Signal;
use crate::gather::{Gather, Member, gather};
use crate::promise::Promise;
use crate::registry::{ModuleRegistry, SuiteContext};
use crate::step::{BoxProducer, ProducerExt, Step, iter, once, wait};
use crate::suite::TestClass;
use crate::unit::Unit;
use crate::{ensure_eq, ensure_that};

static NEXT_PORT: AtomicU16 = AtomicU16::new(8060);

/// `start_server(name)`, `echo(value)` and `fail(message)`.
pub fn functions() -> FunctionTable {
    FunctionTable::new()
        .register("start_server", |state, args| {
            let name = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("start_server expects an application name"))?
                .to_string();
            let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
            let mut cfg = Map::new();
            cfg.insert("concurrency".to_string(), json!("thread"));
            let handle = ApplicationHandle::new(name.as_str(), ([127, 0, 0, 1], port).into(), cfg);
            state.start_application(handle)?;
            Ok(json!(name))
        })
        .register("echo", |_, args| Ok(args.into_iter().next().unwrap_or(Value::Null)))
        .register("fail", |_, args| {
            let message = args.first().and_then(Value::as_str).unwrap_or("failed on request");
            Err(Signal::failure(message).into())
        })
}

pub fn registry() -> ModuleRegistry {
    ModuleRegistry::new()
        .register_class("regression.calculator", |_: &SuiteContext| {
            Box::new(CalculatorTest) as Box<dyn TestClass>
        })
        .register_class("regression.echo", |ctx: &SuiteContext| {
            Box::new(EchoServerTest::new(ctx)) as Box<dyn TestClass>
        })
        .register_class("regression.multi", |ctx: &SuiteContext| {
            Box::new(MultiTest {
                mailbox: ctx.mailbox.clone(),
            }) as Box<dyn TestClass>
        })
}

fn finished() -> BoxProducer {
    once(|| Ok(Value::Null)).boxed()
}

pub struct CalculatorTest;

impl TestClass for CalculatorTest {
    fn name(&self) -> &str {
        "CalculatorTest"
    }

    fn units(&mut self) -> Vec<Unit> {
        vec![
            Unit::sync("test_add", |_| {
                ensure_eq!(2 + 3, 5);
                Ok(())
            }),
            Unit::sync("test_checked_div", |_| {
                ensure_eq!(7_i32.checked_div(0), None);
                ensure_eq!(7_i32.checked_div(2), Some(3));
                Ok(())
            }),
            Unit::sync("test_float_sum", |_| {
                let total: f64 = [0.1, 0.2].iter().sum();
                ensure_eq!(total, 0.3);
                Ok(())
            })
            .expected_failure(),
            Unit::new("test_yields_control", |_| {
                Ok(iter(vec![Step::Value(json!(1)), Step::Value(json!(2))]).boxed())
            }),
        ]
    }
}

/// Talks to an application hosted by the arbiter.
pub struct EchoServerTest {
    mailbox: Mailbox,
    server: String,
    handle: Arc<Mutex<Option<ApplicationHandle>>>,
}

impl EchoServerTest {
    pub fn new(ctx: &SuiteContext) -> Self {
        Self {
            mailbox: ctx.mailbox.clone(),
            server: format!("{}-server", ctx.app),
            handle: Arc::default(),
        }
    }
}

impl TestClass for EchoServerTest {
    fn name(&self) -> &str {
        "EchoServerTest"
    }

    fn init_tests(&mut self) -> Option<BoxProducer> {
        let mailbox = self.mailbox.clone();
        let server = self.server.clone();
        let handle = self.handle.clone();
        let started = self.mailbox.run(ARBITER, "start_server", vec![json!(server)]);
        Some(
            wait(started)
                .and_then(move |_| Ok(wait(mailbox.get_application(server)).boxed()))
                .and_then(move |value| {
                    let app = ApplicationHandle::from_value(value)?
                        .ok_or_else(|| Signal::msg("server did not register"))?;
                    *handle.lock() = Some(app);
                    Ok(finished())
                })
                .boxed(),
        )
    }

    fn end_tests(&mut self) -> Option<BoxProducer> {
        let killed = self.mailbox.kill_actor(self.server.as_str());
        Some(
            wait(killed)
                .and_then(|stopped| {
                    ensure_eq!(stopped, json!(true));
                    Ok(finished())
                })
                .boxed(),
        )
    }

    fn units(&mut self) -> Vec<Unit> {
        let handle = self.handle.clone();
        let with_handle = handle.clone();
        let mailbox = self.mailbox.clone();
        let gather_mailbox = self.mailbox.clone();
        vec![
            Unit::sync("test_address", move |_| {
                let guard = handle.lock();
                let app = guard.as_ref().ok_or_else(|| Signal::msg("no handle"))?;
                ensure_that!(app.address.ip().is_loopback(), "{} is not local", app.address);
                ensure_that!(app.address.port() > 0, "no port assigned");
                Ok(())
            }),
            Unit::sync("test_exc_id", move |_| {
                let guard = with_handle.lock();
                let app = guard.as_ref().ok_or_else(|| Signal::msg("no handle"))?;
                ensure_that!(
                    app.exc_id().is_some_and(|id| !id.is_empty()),
                    "missing exc_id in {:?}",
                    app.cfg
                );
                Ok(())
            }),
            Unit::new("test_echo", move |_| {
                let reply = mailbox.run(ARBITER, "echo", vec![json!("hello")]);
                Ok(wait(reply)
                    .and_then(|value| {
                        ensure_eq!(value, json!("hello"));
                        Ok(finished())
                    })
                    .boxed())
            }),
            Unit::new("test_gather_echoes", move |_| {
                let joined = gather(vec![
                    Member::from(gather_mailbox.run(ARBITER, "echo", vec![json!("a")])),
                    Member::from(gather_mailbox.run(ARBITER, "echo", vec![json!("b")])),
                    Member::from("bla"),
                ]);
                Ok(wait(joined)
                    .and_then(|value| {
                        ensure_eq!(value, json!(["a", "b", "bla"]));
                        Ok(finished())
                    })
                    .boxed())
            }),
        ]
    }
}

/// Joins over local and remote promises.
pub struct MultiTest {
    mailbox: Mailbox,
}

impl TestClass for MultiTest {
    fn name(&self) -> &str {
        "MultiTest"
    }

    fn units(&mut self) -> Vec<Unit> {
        let mailbox = self.mailbox.clone();
        vec![
            Unit::sync("test_empty", |_| {
                ensure_eq!(Gather::list().lock()?.result()?, json!([]));
                ensure_eq!(Gather::map().lock()?.result()?, json!({}));
                Ok(())
            }),
            Unit::sync("test_insertion_order", |_| {
                let (a, b) = (Promise::new(), Promise::new());
                let multi = Gather::list();
                multi.append(a.clone())?.append(b.clone())?.append("bla")?;
                let joined = multi.lock()?;
                b.resolve(json!("second"))?;
                a.resolve(json!("first"))?;
                ensure_eq!(joined.result()?, json!(["first", "second", "bla"]));
                Ok(())
            }),
            Unit::sync("test_nested", |_| {
                let joined = gather(vec![Member::from((1..=10).map(|i| json!(i)).collect::<Vec<_>>())]);
                ensure_eq!(joined.result()?, json!([[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]]));
                Ok(())
            }),
            Unit::new("test_remote_failure", move |_| {
                let joined = gather(vec![
                    Member::from(mailbox.run(ARBITER, "echo", vec![json!(1)])),
                    Member::from(mailbox.run(ARBITER, "fail", vec![json!("remote said no")])),
                ]);
                Ok(wait(joined).boxed())
            })
            .expected_failure(),
        ]
    }
}
