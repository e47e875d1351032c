// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hive::{Actor, Config, Context, Error, Handle, Message, MessageKind, ModuleRegistry, Node};

const WAIT: Duration = Duration::from_secs(10);

/// A module that does nothing; KILL fodder.
struct Nop;

impl Actor for Nop {
    fn init(&mut self, _ctx: &Context, _args: &str) -> Result<(), Error> {
        Ok(())
    }
    fn dispatch(&mut self, _ctx: &Context, _message: Message) {}
}

fn nop_module() -> Arc<dyn hive::Module> {
    Arc::new(|| Box::new(Nop) as Box<dyn Actor>)
}

/// Sends itself one message per dispatch until the counter is reached, then
/// reports the count and exits.
struct Ping {
    report: Sender<u64>,
    count: u64,
    limit: u64,
}

#[test]
fn ping_round_trip_s1() {
    impl Actor for Ping {
        fn init(&mut self, ctx: &Context, _args: &str) -> Result<(), Error> {
            ctx.send(ctx.handle(), MessageKind::Client, 0, b"PING".to_vec())?;
            Ok(())
        }

        fn dispatch(&mut self, ctx: &Context, message: Message) {
            assert_eq!(&message.payload, b"PING");
            assert_eq!(hive::current_handle(), ctx.handle());
            self.count += 1;
            if self.count >= self.limit {
                self.report.send(self.count).unwrap();
                ctx.exit();
            } else {
                ctx.send(ctx.handle(), MessageKind::Client, 0, b"PING".to_vec())
                    .unwrap();
            }
        }
    }

    let (tx, rx) = channel();
    let tx = Arc::new(Mutex::new(tx));

    let modules = ModuleRegistry::new();
    modules
        .register(
            "ping",
            Arc::new(move || {
                Box::new(Ping {
                    report: tx.lock().unwrap().clone(),
                    count: 0,
                    limit: 1000,
                }) as Box<dyn Actor>
            }),
        )
        .unwrap();

    let config = Config {
        thread: 2,
        ..Config::default()
    };
    let node = Node::new(&config, modules).unwrap();
    node.launch("ping", "").unwrap();
    node.run().unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1000);
}

/// A self-saturating service: every message triggers one more, until a STOP
/// payload arrives.
struct Hog;

/// Reports how long the probe took to arrive despite the hog, then tells
/// the hog to stop.
struct Probe {
    report: Sender<Duration>,
    started: Arc<Mutex<Option<Instant>>>,
    hog: Handle,
}

/// Fires the probe at a target service, stamping the send time.
struct Trigger {
    started: Arc<Mutex<Option<Instant>>>,
    target: Handle,
}

#[test]
fn fairness_under_saturation_s3() {
    impl Actor for Hog {
        fn init(&mut self, ctx: &Context, _args: &str) -> Result<(), Error> {
            ctx.send(ctx.handle(), MessageKind::Client, 0, Vec::new())?;
            Ok(())
        }

        fn dispatch(&mut self, ctx: &Context, message: Message) {
            if message.payload == b"STOP" {
                ctx.exit();
                return;
            }
            let _ = ctx.send(ctx.handle(), MessageKind::Client, 0, Vec::new());
        }
    }

    impl Actor for Probe {
        fn init(&mut self, _ctx: &Context, args: &str) -> Result<(), Error> {
            self.hog = Handle::parse_hex(args).expect("hog handle in args");
            Ok(())
        }

        fn dispatch(&mut self, ctx: &Context, message: Message) {
            if message.kind != MessageKind::Client {
                return;
            }
            let started = self.started.lock().unwrap().expect("probe was sent");
            self.report.send(started.elapsed()).unwrap();
            ctx.send(self.hog, MessageKind::Client, 0, b"STOP".to_vec())
                .unwrap();
            ctx.exit();
        }
    }

    impl Actor for Trigger {
        fn init(&mut self, ctx: &Context, args: &str) -> Result<(), Error> {
            self.target = Handle::parse_hex(args).expect("target handle in args");
            // Let the hog saturate first, then fire the probe.
            ctx.timeout(20);
            Ok(())
        }

        fn dispatch(&mut self, ctx: &Context, message: Message) {
            if message.kind == MessageKind::Response {
                *self.started.lock().unwrap() = Some(Instant::now());
                ctx.send(self.target, MessageKind::Client, 0, b"probe".to_vec())
                    .unwrap();
                ctx.exit();
            }
        }
    }

    let (tx, rx) = channel();
    let tx = Arc::new(Mutex::new(tx));
    let started = Arc::new(Mutex::new(None));

    let modules = ModuleRegistry::new();
    modules
        .register("hog", Arc::new(|| Box::new(Hog) as Box<dyn Actor>))
        .unwrap();
    {
        let tx = tx.clone();
        let started = started.clone();
        modules
            .register(
                "probe",
                Arc::new(move || {
                    Box::new(Probe {
                        report: tx.lock().unwrap().clone(),
                        started: started.clone(),
                        hog: Handle::ZERO,
                    }) as Box<dyn Actor>
                }),
            )
            .unwrap();
    }
    {
        let started = started.clone();
        modules
            .register(
                "trigger",
                Arc::new(move || {
                    Box::new(Trigger {
                        started: started.clone(),
                        target: Handle::ZERO,
                    }) as Box<dyn Actor>
                }),
            )
            .unwrap();
    }

    // Two workers at weight -1: the hog must hand its mailbox back after
    // every message, so the probe cannot starve.
    let config = Config {
        thread: 2,
        ..Config::default()
    };
    let node = Node::new(&config, modules).unwrap();

    let hog = node.launch("hog", "").unwrap();
    let probe = node.launch("probe", &hog.to_string()).unwrap();
    node.launch("trigger", &probe.to_string()).unwrap();

    node.run().unwrap();

    let latency = rx.recv_timeout(WAIT).unwrap();
    assert!(
        latency < Duration::from_millis(500),
        "probe took {latency:?} under saturation"
    );
}

/// Exercises the delivery guarantee: a message either reaches its
/// destination or bounces back as an Error with the same session.
struct Bouncer {
    report: Sender<(i32, i32)>,
    victim: Handle,
}

#[test]
fn dead_destination_bounces_error() {
    impl Actor for Bouncer {
        fn init(&mut self, ctx: &Context, _args: &str) -> Result<(), Error> {
            let victim = ctx.command("LAUNCH", "nop").expect("launch nop");
            self.victim = Handle::parse_hex(&victim).unwrap();
            ctx.command("KILL", &victim);

            // The victim is gone: the send fails at the call site and an
            // Error message with our session comes back.
            let result = ctx.send(self.victim, MessageKind::Client, 77, b"late".to_vec());
            assert!(result.is_err());
            Ok(())
        }

        fn dispatch(&mut self, ctx: &Context, message: Message) {
            if message.kind == MessageKind::Error {
                self.report
                    .send((message.session, message.source.raw() as i32))
                    .unwrap();
                ctx.exit();
            }
        }
    }

    let (tx, rx) = channel();
    let tx = Arc::new(Mutex::new(tx));

    let modules = ModuleRegistry::new();
    modules.register("nop", nop_module()).unwrap();
    {
        let tx = tx.clone();
        modules
            .register(
                "bouncer",
                Arc::new(move || {
                    Box::new(Bouncer {
                        report: tx.lock().unwrap().clone(),
                        victim: Handle::ZERO,
                    }) as Box<dyn Actor>
                }),
            )
            .unwrap();
    }

    let config = Config {
        thread: 2,
        ..Config::default()
    };
    let node = Node::new(&config, modules).unwrap();
    node.launch("bouncer", "").unwrap();
    node.run().unwrap();

    let (session, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(session, 77);
}

/// Drives the command surface from inside a service.
struct Commander {
    report: Sender<Vec<(String, Option<String>)>>,
}

#[test]
fn command_surface() {
    impl Actor for Commander {
        fn init(&mut self, ctx: &Context, _args: &str) -> Result<(), Error> {
            let mut out = Vec::new();
            let mut record = |name: &str, value: Option<String>| {
                out.push((name.to_string(), value));
            };

            record("reg_empty", ctx.command("REG", ""));
            record("reg_name", ctx.command("REG", ".commander"));
            record("query", ctx.command("QUERY", ".commander"));
            record("query_missing", ctx.command("QUERY", ".ghost"));
            record("name", ctx.command("NAME", &format!(".alias {}", ctx.handle())));
            record("query_alias", ctx.command("QUERY", ".alias"));
            record("dup_name", ctx.command("REG", ".commander"));

            ctx.command("SETENV", "answer 42");
            record("getenv", ctx.command("GETENV", "answer"));
            record("getenv_missing", ctx.command("GETENV", "nothing"));

            let own_address = ctx.handle().to_string();
            record("logon", ctx.command("LOGON", &own_address));
            record("logoff", ctx.command("LOGOFF", &own_address));

            record("starttime", ctx.command("STARTTIME", ""));
            record("stat_mqlen", ctx.command("STAT", "mqlen"));
            record("stat_endless", ctx.command("STAT", "endless"));
            record("stat_message", ctx.command("STAT", "message"));
            record("unknown", ctx.command("BOGUS", ""));

            // Named sends resolve through the same address grammar.
            assert!(ctx
                .send_name(".commander", MessageKind::Client, 0, b"self".to_vec())
                .is_ok());
            assert!(ctx
                .send_name(".ghost", MessageKind::Client, 0, Vec::new())
                .is_err());
            assert!(ctx
                .send_name("garbage", MessageKind::Client, 0, Vec::new())
                .is_err());

            self.report.send(out).unwrap();
            ctx.command("EXIT", "");
            Ok(())
        }

        fn dispatch(&mut self, _ctx: &Context, _message: Message) {}
    }

    let (tx, rx) = channel();
    let tx = Arc::new(Mutex::new(tx));

    let modules = ModuleRegistry::new();
    {
        let tx = tx.clone();
        modules
            .register(
                "commander",
                Arc::new(move || {
                    Box::new(Commander {
                        report: tx.lock().unwrap().clone(),
                    }) as Box<dyn Actor>
                }),
            )
            .unwrap();
    }

    let config = Config {
        thread: 1,
        logpath: std::env::temp_dir().to_string_lossy().into_owned(),
        ..Config::default()
    };
    let node = Node::new(&config, modules).unwrap();
    let handle = node.launch("commander", "").unwrap();

    let results: std::collections::HashMap<String, Option<String>> =
        rx.recv_timeout(WAIT).unwrap().into_iter().collect();

    assert_eq!(results["reg_empty"].as_deref(), Some(handle.to_string().as_str()));
    assert_eq!(results["reg_name"].as_deref(), Some(".commander"));
    assert_eq!(
        results["query"].as_deref(),
        Some(handle.to_string().as_str())
    );
    assert_eq!(results["query_missing"], None);
    assert_eq!(results["name"].as_deref(), Some(".alias"));
    assert_eq!(
        results["query_alias"].as_deref(),
        Some(handle.to_string().as_str())
    );
    // Names are append-only:
    assert_eq!(results["dup_name"], None);
    assert_eq!(results["getenv"].as_deref(), Some("42"));
    assert_eq!(results["getenv_missing"], None);
    assert!(results["logon"].is_some());
    assert_eq!(results["logoff"], None);
    assert!(results["starttime"].as_ref().unwrap().parse::<u64>().unwrap() > 0);
    assert_eq!(results["stat_mqlen"].as_deref(), Some("0"));
    assert_eq!(results["stat_endless"].as_deref(), Some("0"));
    assert_eq!(results["stat_message"].as_deref(), Some("0"));
    assert_eq!(results["unknown"], None);

    // The EXIT in init retired the service:
    assert!(node.grab(handle).is_none());
    assert_eq!(node.total(), 0);
}

/// Slot-table growth: far more services than the initial four slots, every
/// handle distinct and resolvable throughout.
#[test]
fn registry_grows_past_initial_capacity() {
    let modules = ModuleRegistry::new();
    modules.register("nop", nop_module()).unwrap();

    let config = Config::default();
    let node = Node::new(&config, modules).unwrap();

    let mut handles = Vec::new();
    for _ in 0..40 {
        handles.push(node.launch("nop", "").unwrap());
    }

    let mut unique = handles.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), handles.len());

    for &handle in &handles {
        assert_eq!(node.grab(handle).unwrap().handle(), handle);
    }
    assert_eq!(node.total(), 40);

    // Retired handles stop resolving; the rest survive the rehash.
    for &handle in &handles[..20] {
        assert!(node.retire(handle));
        assert!(node.grab(handle).is_none());
    }
    for &handle in &handles[20..] {
        assert!(node.grab(handle).is_some());
    }
    assert_eq!(node.total(), 20);
}

/// Receives cross-node envelopes and acks the original sender.
struct RemoteSink {
    report: Sender<(Handle, MessageKind, Vec<u8>)>,
}

/// Sends one message to a handle on another node, then waits for the ack.
struct RemoteSender;

#[test]
fn remote_destination_goes_through_the_forwarder() {
    impl Actor for RemoteSink {
        fn init(&mut self, _ctx: &Context, _args: &str) -> Result<(), Error> {
            Ok(())
        }

        fn dispatch(&mut self, ctx: &Context, message: Message) {
            if message.kind != MessageKind::Harbor {
                return;
            }
            let (destination, kind, body) =
                hive::harbor::decode_remote(&message.payload).expect("harbor envelope");
            self.report
                .send((destination, kind, body.to_vec()))
                .unwrap();
            ctx.send(message.source, MessageKind::Client, 0, b"ack".to_vec())
                .unwrap();
        }
    }

    impl Actor for RemoteSender {
        fn init(&mut self, ctx: &Context, _args: &str) -> Result<(), Error> {
            // Node 2 is not us (we boot as node 1), so this send must be
            // re-addressed to the forwarder.
            let faraway = Handle::from_parts(2, 0x42);
            ctx.send(faraway, MessageKind::Client, 9, b"hi".to_vec())?;
            Ok(())
        }

        fn dispatch(&mut self, ctx: &Context, message: Message) {
            if message.kind == MessageKind::Client {
                assert_eq!(&message.payload, b"ack");
                ctx.exit();
            }
        }
    }

    let (tx, rx) = channel();
    let tx = Arc::new(Mutex::new(tx));

    let modules = ModuleRegistry::new();
    {
        let tx = tx.clone();
        modules
            .register(
                "remote-sink",
                Arc::new(move || {
                    Box::new(RemoteSink {
                        report: tx.lock().unwrap().clone(),
                    }) as Box<dyn Actor>
                }),
            )
            .unwrap();
    }
    modules
        .register("remote-sender", Arc::new(|| Box::new(RemoteSender) as Box<dyn Actor>))
        .unwrap();

    let config = Config {
        thread: 2,
        harbor: 1,
        ..Config::default()
    };
    let node = Node::new(&config, modules).unwrap();

    let sink = node.launch("remote-sink", "").unwrap();
    hive::harbor::start(&node, sink).unwrap();
    // The forwarder no longer counts toward the shutdown predicate:
    assert_eq!(node.total(), 0);

    node.launch("remote-sender", "").unwrap();
    node.run().unwrap();

    let (destination, kind, body) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(destination, Handle::from_parts(2, 0x42));
    assert_eq!(kind, MessageKind::Client);
    assert_eq!(body, b"hi");

    // The reserved forwarder outlived the shutdown predicate.
    assert!(node.grab(sink).is_some());
}

/// A failed init aborts the launch and leaves nothing registered.
struct FailsInit;

#[test]
fn failed_init_retires_service() {
    impl Actor for FailsInit {
        fn init(&mut self, _ctx: &Context, _args: &str) -> Result<(), Error> {
            Err(Error::BadAddress("nope".to_string()))
        }
        fn dispatch(&mut self, _ctx: &Context, _message: Message) {}
    }

    let modules = ModuleRegistry::new();
    modules
        .register("broken", Arc::new(|| Box::new(FailsInit) as Box<dyn Actor>))
        .unwrap();

    let config = Config::default();
    let node = Node::new(&config, modules).unwrap();

    assert!(node.launch("broken", "").is_err());
    assert_eq!(node.total(), 0);
    assert!(node.launch("missing-module", "").is_err());
}
