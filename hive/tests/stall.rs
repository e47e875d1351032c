// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hive::{Actor, Config, Context, Error, Message, MessageKind, ModuleRegistry, Node};

/// Spins inside a single dispatch until the stall monitor marks it, which
/// it observes through its own STAT endless. Verifies the report-once
/// semantics, then exits so the runtime can shut down.
struct Spinner {
    report: Sender<(Duration, bool)>,
}

#[test]
fn stall_monitor_marks_endless_s6() {
    impl Actor for Spinner {
        fn init(&mut self, ctx: &Context, _args: &str) -> Result<(), Error> {
            ctx.send(ctx.handle(), MessageKind::Client, 0, Vec::new())?;
            Ok(())
        }

        fn dispatch(&mut self, ctx: &Context, _message: Message) {
            let entered = Instant::now();

            // The monitor samples every 5 s; two identical samples with a
            // dispatch in flight raise the mark, so this loop ends within
            // roughly ten seconds.
            loop {
                if ctx.command("STAT", "endless").as_deref() == Some("1") {
                    break;
                }
                if entered.elapsed() > Duration::from_secs(30) {
                    panic!("stall monitor never marked this service");
                }
                std::hint::spin_loop();
            }

            // The mark reports once, then rearms.
            let cleared = ctx.command("STAT", "endless").as_deref() == Some("0");
            self.report.send((entered.elapsed(), cleared)).unwrap();
            ctx.exit();
        }
    }

    let (tx, rx) = channel();
    let tx = Arc::new(Mutex::new(tx));

    let modules = ModuleRegistry::new();
    modules
        .register(
            "spinner",
            Arc::new(move || {
                Box::new(Spinner {
                    report: tx.lock().unwrap().clone(),
                }) as Box<dyn Actor>
            }),
        )
        .unwrap();

    let config = Config {
        thread: 2,
        ..Config::default()
    };
    let node = Node::new(&config, modules).unwrap();
    node.launch("spinner", "").unwrap();
    node.run().unwrap();

    let (stuck_for, cleared) = rx.recv_timeout(Duration::from_secs(40)).unwrap();
    assert!(
        stuck_for < Duration::from_secs(15),
        "detection took {stuck_for:?}"
    );
    assert!(cleared, "endless mark did not clear after the first report");
}
