// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Node assembly: the shared runtime state, the send path, service launch
//! and retirement, and the thread set (workers, timer, socket, monitor).

use log::*;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use socket_server::{SocketServer, SocketServerHandle};

use crate::env::Env;
use crate::handle::Handle;
use crate::mailbox::{GlobalQueue, Mailbox};
use crate::message::{Message, MessageKind, MAX_MESSAGE_SIZE};
use crate::module::ModuleRegistry;
use crate::monitor::WorkerWatch;
use crate::registry::Registry;
use crate::service::Service;
use crate::timer::Timer;
use crate::worker::{weight_for, worker_main};
use crate::Error;

/// How long the timer thread sleeps between clock samples.
const TIMER_NAP: Duration = Duration::from_micros(2500);

/// Seconds between stall-monitor sampling passes.
const MONITOR_PERIOD: u64 = 5;

/// Boot parameters. Every field is mirrored into the env store so services
/// can read the configuration back with GETENV.
#[derive(Clone, Debug)]
pub struct Config {
    /// Worker thread count.
    pub thread: usize,
    /// This node's cluster ID (the high byte of every local handle).
    pub harbor: u8,
    /// Initial command, `"module args"`, launched after the log service.
    pub bootstrap: Option<String>,
    /// Module name of the log service.
    pub logservice: String,
    /// Argument for the log service (typically an output path).
    pub logger: Option<String>,
    /// Module search pattern; accepted for compatibility, modules resolve
    /// from the static registry.
    pub cpath: Option<String>,
    /// Meter per-service CPU cost.
    pub profile: bool,
    /// Directory for per-service message logs (LOGON).
    pub logpath: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            thread: 8,
            harbor: 1,
            bootstrap: None,
            logservice: "logger".to_string(),
            logger: None,
            cpath: None,
            profile: false,
            logpath: ".".to_string(),
        }
    }
}

struct SleepState {
    sleeping: usize,
    quit: bool,
}

/// Everything the threads share. One per process in the daemon; tests build
/// as many as they like.
pub struct Node {
    registry: Registry,
    global: GlobalQueue,
    timer: Timer,
    env: Env,
    modules: ModuleRegistry,
    socket: SocketServerHandle,
    /// Taken by the socket thread when `run` starts.
    socket_server: Mutex<Option<SocketServer>>,
    sleep: Mutex<SleepState>,
    wake: Condvar,
    /// Mirror of `sleep.sleeping` so the wake fast path can skip the lock.
    sleeping_hint: AtomicUsize,
    /// Live services; the shutdown predicate is this reaching zero.
    total: AtomicUsize,
    /// Service notified (kind System) on every exit, 0 when unset.
    monitor_exit: AtomicU32,
    /// Handle of the cross-node forwarder, 0 when the node is standalone.
    remote: AtomicU32,
    /// Services excluded from the liveness count (the harbor forwarder).
    reserved: Mutex<Vec<Arc<Service>>>,
    worker_count: usize,
    profile: bool,
    logpath: String,
}

impl Node {
    pub fn new(config: &Config, modules: ModuleRegistry) -> Result<Arc<Node>, Error> {
        let (socket_server, socket) = socket_server::create()?;

        let env = Env::new();
        env.set("thread", &config.thread.to_string());
        env.set("harbor", &config.harbor.to_string());
        env.set("logservice", &config.logservice);
        env.set("logpath", &config.logpath);
        env.set("profile", if config.profile { "1" } else { "0" });
        if let Some(bootstrap) = &config.bootstrap {
            env.set("bootstrap", bootstrap);
        }
        if let Some(logger) = &config.logger {
            env.set("logger", logger);
        }
        if let Some(cpath) = &config.cpath {
            env.set("cpath", cpath);
        }

        Ok(Arc::new(Node {
            registry: Registry::new(config.harbor),
            global: GlobalQueue::new(),
            timer: Timer::new(),
            env,
            modules,
            socket,
            socket_server: Mutex::new(Some(socket_server)),
            sleep: Mutex::new(SleepState {
                sleeping: 0,
                quit: false,
            }),
            wake: Condvar::new(),
            sleeping_hint: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            monitor_exit: AtomicU32::new(0),
            remote: AtomicU32::new(0),
            reserved: Mutex::new(Vec::new()),
            worker_count: config.thread.max(1),
            profile: config.profile,
            logpath: config.logpath.clone(),
        }))
    }

    // -- accessors -----------------------------------------------------

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub(crate) fn global(&self) -> &GlobalQueue {
        &self.global
    }

    pub(crate) fn socket(&self) -> &SocketServerHandle {
        &self.socket
    }

    pub fn node_id(&self) -> u8 {
        self.registry.node_id()
    }

    /// Count of live services (reserved ones excluded).
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub(crate) fn logpath(&self) -> String {
        self.logpath.clone()
    }

    pub fn grab(&self, handle: Handle) -> Option<Arc<Service>> {
        self.registry.grab(handle)
    }

    pub fn find_name(&self, name: &str) -> Option<Handle> {
        self.registry.find(name)
    }

    pub fn bind_name(&self, name: &str, handle: Handle) -> bool {
        self.registry.bind_name(name, handle)
    }

    pub(crate) fn monitor_exit(&self) -> Handle {
        Handle::new(self.monitor_exit.load(Ordering::Relaxed))
    }

    pub(crate) fn set_monitor_exit(&self, handle: Handle) {
        self.monitor_exit.store(handle.raw(), Ordering::Relaxed);
    }

    // -- service life cycle --------------------------------------------

    /// Create a service from a registered module and run its init on the
    /// calling thread. The mailbox only joins the run queue once init
    /// succeeds; on failure every message it accumulated bounces.
    pub fn launch(self: &Arc<Self>, module_name: &str, args: &str) -> Result<Handle, Error> {
        let module = self
            .modules
            .query(module_name)
            .ok_or_else(|| Error::ModuleNotFound(module_name.to_string()))?;

        let actor = module.create();
        let service = self.registry.register_with(|handle| {
            Service::new(self.clone(), handle, module_name, actor, self.profile)
        })?;
        self.total.fetch_add(1, Ordering::AcqRel);

        let handle = service.handle();
        match service.init(args) {
            Ok(()) => {
                self.global.push(service.mailbox().clone());
                self.signal_worker();
                trace!("launched {module_name} as {handle}");
                Ok(handle)
            }
            Err(e) => {
                crate::log::error_to(self, handle, format!("init of {module_name} failed: {e}"));
                self.retire(handle);
                self.drain_with_errors(service.mailbox());
                Err(Error::ModuleInitFailed(module_name.to_string()))
            }
        }
    }

    /// EXIT/KILL entry: log, notify the exit watcher, then retire. A zero
    /// target means the caller itself.
    pub(crate) fn handle_exit(self: &Arc<Self>, source: Handle, target: Handle) {
        let target = if target.is_zero() { source } else { target };
        if target == source {
            crate::log::error_to(self, target, "KILL self".to_string());
        } else {
            crate::log::error_to(self, source, format!("KILL {target}"));
        }

        let watcher = self.monitor_exit();
        if !watcher.is_zero() {
            let _ = self.push_message(
                watcher,
                Message {
                    source: target,
                    session: 0,
                    kind: MessageKind::System,
                    payload: Vec::new(),
                },
            );
        }

        self.retire(target);
    }

    /// Drop a handle from the registry. The mailbox is marked released so
    /// the next worker that picks it up bounces the remaining messages.
    pub fn retire(&self, handle: Handle) -> bool {
        let Some(service) = self.registry.retire(handle) else {
            return false;
        };

        trace!("retired {handle} ({})", service.module_name());
        service.mailbox().mark_release();

        let was_reserved = self
            .reserved
            .lock()
            .expect("reserved list lock poisoned")
            .iter()
            .any(|s| s.handle() == handle);
        if !was_reserved {
            self.total.fetch_sub(1, Ordering::AcqRel);
        }

        // `service` drops here, outside the registry lock.
        true
    }

    /// ABORT: retire everything, repeatedly, until a scan finds nothing.
    pub(crate) fn retire_all(self: &Arc<Self>) {
        loop {
            let handles = self.registry.live_handles();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                self.retire(handle);
            }
        }
    }

    /// Exclude a service from the liveness count while keeping it
    /// registered (the harbor forwarder).
    pub(crate) fn reserve(&self, service: Arc<Service>) {
        self.remote.store(service.handle().raw(), Ordering::Release);
        self.reserved
            .lock()
            .expect("reserved list lock poisoned")
            .push(service);
        self.total.fetch_sub(1, Ordering::AcqRel);
    }

    // -- message paths -------------------------------------------------

    /// Deliver a runtime-synthesized message (timer response, socket event).
    pub(crate) fn push_message(&self, destination: Handle, message: Message) -> Result<(), Error> {
        let service = self
            .registry
            .grab(destination)
            .ok_or(Error::InvalidHandle(destination))?;

        service.mailbox().push(&self.global, message);
        self.signal_worker();
        Ok(())
    }

    /// The send path every service uses. Local destinations get the message
    /// queued; remote ones are re-addressed to the harbor forwarder. A dead
    /// destination bounces an `Error` message back to the sender.
    pub(crate) fn send(
        &self,
        source: Handle,
        destination: Handle,
        kind: MessageKind,
        session: i32,
        payload: Vec<u8>,
    ) -> Result<i32, Error> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(payload.len()));
        }
        if destination.is_zero() {
            return Err(Error::InvalidHandle(destination));
        }

        if destination.is_remote(self.node_id()) {
            let remote = Handle::new(self.remote.load(Ordering::Acquire));
            if remote.is_zero() {
                warn!("no remote forwarder for {destination}");
                return Err(Error::InvalidHandle(destination));
            }
            let envelope = crate::harbor::encode_remote(destination, kind, &payload);
            self.push_message(
                remote,
                Message {
                    source,
                    session,
                    kind: MessageKind::Harbor,
                    payload: envelope,
                },
            )?;
            return Ok(session);
        }

        match self.push_message(
            destination,
            Message {
                source,
                session,
                kind,
                payload,
            },
        ) {
            Ok(()) => Ok(session),
            Err(e) => {
                self.bounce(destination, source, session);
                Err(e)
            }
        }
    }

    /// Error-drop policy: everything left in a dead service's mailbox turns
    /// into an `Error` message back at its sender.
    pub(crate) fn drain_with_errors(&self, mailbox: &Arc<Mailbox>) {
        let dead = mailbox.handle();
        mailbox.drain(|message| {
            self.bounce(dead, message.source, message.session);
        });
    }

    fn bounce(&self, failed_destination: Handle, sender: Handle, session: i32) {
        if sender.is_zero() {
            return;
        }
        if let Some(service) = self.registry.grab(sender) {
            service
                .mailbox()
                .push(&self.global, Message::delivery_error(failed_destination, session));
            self.signal_worker();
        }
    }

    /// Schedule a `Response` after `ticks`; non-positive fires immediately.
    pub(crate) fn timeout(&self, handle: Handle, ticks: i32, session: i32) {
        if ticks <= 0 {
            let _ = self.push_message(
                handle,
                Message {
                    source: Handle::ZERO,
                    session,
                    kind: MessageKind::Response,
                    payload: Vec::new(),
                },
            );
            return;
        }
        self.timer.insert(handle, ticks as u32, session);
    }

    // -- worker parking ------------------------------------------------

    /// Wake one sleeping worker, if any. Cheap when everyone is busy.
    pub(crate) fn signal_worker(&self) {
        if self.sleeping_hint.load(Ordering::Relaxed) > 0 {
            let _guard = self.sleep.lock().expect("sleep lock poisoned");
            self.wake.notify_one();
        }
    }

    /// Park the calling worker until woken. Returns false when the runtime
    /// is shutting down.
    pub(crate) fn worker_sleep(&self) -> bool {
        let mut state = self.sleep.lock().expect("sleep lock poisoned");
        if state.quit {
            return false;
        }

        state.sleeping += 1;
        self.sleeping_hint.store(state.sleeping, Ordering::Relaxed);

        state = self.wake.wait(state).expect("sleep lock poisoned");

        state.sleeping -= 1;
        self.sleeping_hint.store(state.sleeping, Ordering::Relaxed);

        !state.quit
    }

    fn broadcast_quit(&self) {
        let mut state = self.sleep.lock().expect("sleep lock poisoned");
        state.quit = true;
        self.wake.notify_all();
    }

    // -- boot and threads ----------------------------------------------

    /// Launch the log service (named "logger") and the bootstrap command.
    /// Call before `run`; a bootstrap failure is fatal to the caller.
    pub fn bootstrap(self: &Arc<Self>, config: &Config) -> Result<(), Error> {
        let logger = self.launch(
            &config.logservice,
            config.logger.as_deref().unwrap_or(""),
        )?;
        self.registry.bind_name("logger", logger);

        if let Some(line) = &config.bootstrap {
            let line = line.trim();
            let (module, args) = match line.split_once(char::is_whitespace) {
                Some((module, args)) => (module, args.trim()),
                None => (line, ""),
            };
            self.launch(module, args)?;
        }

        Ok(())
    }

    /// Spawn the thread set and block until every service has exited.
    pub fn run(self: &Arc<Self>) -> Result<(), Error> {
        let server = self
            .socket_server
            .lock()
            .expect("socket server lock poisoned")
            .take()
            .expect("run() may only be called once");

        let watches: Vec<Arc<WorkerWatch>> = (0..self.worker_count)
            .map(|_| Arc::new(WorkerWatch::new()))
            .collect();

        let mut threads = Vec::new();

        {
            let node = self.clone();
            let watches = watches.clone();
            threads.push(std::thread::spawn(move || monitor_main(node, watches)));
        }
        {
            let node = self.clone();
            threads.push(std::thread::spawn(move || timer_main(node)));
        }
        {
            let node = self.clone();
            threads.push(std::thread::spawn(move || socket_main(node, server)));
        }
        for (index, watch) in watches.into_iter().enumerate() {
            let node = self.clone();
            let weight = weight_for(index);
            threads.push(std::thread::spawn(move || worker_main(node, watch, weight)));
        }

        for thread in threads {
            let _ = thread.join();
        }
        Ok(())
    }
}

/// Build a node, boot it, and run to completion. The entry point `hived`
/// uses; tests usually drive `Node` directly.
pub fn start(config: &Config, modules: ModuleRegistry) -> Result<(), Error> {
    let node = Node::new(config, modules)?;
    node.bootstrap(config)?;
    node.run()
}

fn timer_main(node: Arc<Node>) {
    let mut fired = Vec::new();

    loop {
        node.timer().update_from_clock(&mut fired);
        for timer in fired.drain(..) {
            let _ = node.push_message(
                timer.handle,
                Message {
                    source: Handle::ZERO,
                    session: timer.session,
                    kind: MessageKind::Response,
                    payload: Vec::new(),
                },
            );
        }

        if node.total() == 0 {
            break;
        }

        node.signal_worker();
        std::thread::sleep(TIMER_NAP);
    }

    // Shutdown order: stop the I/O thread, then release the workers.
    node.socket().exit();
    node.broadcast_quit();
}

fn socket_main(node: Arc<Node>, mut server: SocketServer) {
    loop {
        let event = server.poll();
        if !crate::socket::forward_event(&node, event) {
            break;
        }
        node.signal_worker();
    }
}

fn monitor_main(node: Arc<Node>, watches: Vec<Arc<WorkerWatch>>) {
    loop {
        if node.total() == 0 {
            return;
        }

        for watch in &watches {
            watch.check(&node);
        }

        for _ in 0..MONITOR_PERIOD {
            if node.total() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}
