// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The service object and the dispatch of one message.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::handle::Handle;
use crate::mailbox::Mailbox;
use crate::message::{Message, MessageKind};
use crate::module::Actor;
use crate::node::Node;
use crate::Error;

thread_local! {
    static CURRENT_HANDLE: Cell<u32> = const { Cell::new(0) };
}

/// The handle of the service whose message the calling worker thread is
/// currently dispatching, or zero outside dispatch.
pub fn current_handle() -> Handle {
    CURRENT_HANDLE.with(|c| Handle::new(c.get()))
}

/// One actor: its handle, mailbox, state, and counters. Shared ownership
/// (`Arc`) replaces manual reference counting: the registry slot holds one
/// reference, every `grab` another, and the instance is destroyed exactly
/// when the last one drops.
pub struct Service {
    node: Arc<Node>,
    handle: Handle,
    module_name: String,
    mailbox: Arc<Mailbox>,
    /// Holding this lock IS the exclusive dispatch right; the run-queue
    /// discipline keeps it uncontended.
    actor: Mutex<Box<dyn Actor>>,
    /// Signals that arrived while a message was being dispatched; delivered
    /// before the next one.
    pending_signals: Mutex<Vec<i32>>,
    session: AtomicI32,
    message_count: AtomicU64,
    cpu_cost_us: AtomicU64,
    /// Thread CPU clock at dispatch entry; meaningful only on the thread
    /// currently dispatching (the STAT time command runs there).
    cpu_start_us: AtomicU64,
    endless: AtomicBool,
    init_done: AtomicBool,
    profile: bool,
    message_log: Mutex<Option<std::fs::File>>,
}

impl Service {
    pub(crate) fn new(
        node: Arc<Node>,
        handle: Handle,
        module_name: &str,
        actor: Box<dyn Actor>,
        profile: bool,
    ) -> Arc<Service> {
        Arc::new(Service {
            node,
            handle,
            module_name: module_name.to_string(),
            mailbox: Mailbox::new(handle),
            actor: Mutex::new(actor),
            pending_signals: Mutex::new(Vec::new()),
            session: AtomicI32::new(0),
            message_count: AtomicU64::new(0),
            cpu_cost_us: AtomicU64::new(0),
            cpu_start_us: AtomicU64::new(0),
            endless: AtomicBool::new(false),
            init_done: AtomicBool::new(false),
            profile,
            message_log: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub(crate) fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub(crate) fn init(self: &Arc<Self>, args: &str) -> Result<(), Error> {
        let ctx = Context {
            service: self.clone(),
        };
        let result = {
            let mut actor = self.actor.lock().expect("actor lock poisoned");
            actor.init(&ctx, args)
        };
        if result.is_ok() {
            self.init_done.store(true, Ordering::Release);
        }
        result
    }

    pub(crate) fn init_done(&self) -> bool {
        self.init_done.load(Ordering::Acquire)
    }

    /// Next session ID; skips zero and negatives on wrap so a session can
    /// always be told apart from "no session".
    pub fn alloc_session(&self) -> i32 {
        let session = self.session.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if session <= 0 {
            self.session.store(1, Ordering::Relaxed);
            return 1;
        }
        session
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn cpu_cost_us(&self) -> u64 {
        self.cpu_cost_us.load(Ordering::Relaxed)
    }

    /// CPU seconds spent in the current dispatch; callable only from the
    /// dispatching thread.
    pub(crate) fn dispatch_cpu_us(&self) -> u64 {
        thread_cpu_us().saturating_sub(self.cpu_start_us.load(Ordering::Relaxed))
    }

    /// Report and clear the stall mark.
    pub(crate) fn take_endless(&self) -> bool {
        self.endless.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn mark_endless(&self) {
        self.endless.store(true, Ordering::Relaxed);
    }

    pub(crate) fn profile(&self) -> bool {
        self.profile
    }

    /// Queue a signal; delivered immediately when the actor is idle, else
    /// right before its next dispatch.
    pub(crate) fn deliver_signal(&self, signal: i32) {
        if let Ok(mut actor) = self.actor.try_lock() {
            actor.signal(signal);
            return;
        }
        self.pending_signals
            .lock()
            .expect("signal queue lock poisoned")
            .push(signal);
    }

    pub(crate) fn open_message_log(&self, file: std::fs::File) {
        *self.message_log.lock().expect("message log lock poisoned") = Some(file);
    }

    pub(crate) fn close_message_log(&self) {
        *self.message_log.lock().expect("message log lock poisoned") = None;
    }
}

/// Dispatch one message to its service. Runs on a worker thread with the
/// exclusive right conferred by popping the service's mailbox.
pub(crate) fn dispatch_message(service: &Arc<Service>, message: Message) {
    debug_assert!(service.init_done());

    CURRENT_HANDLE.with(|c| c.set(service.handle.raw()));

    {
        let mut log = service.message_log.lock().expect("message log lock poisoned");
        if let Some(file) = log.as_mut() {
            crate::log::write_record(file, &message, service.node.timer().now());
        }
    }

    service.message_count.fetch_add(1, Ordering::Relaxed);

    let ctx = Context {
        service: service.clone(),
    };

    let mut actor = service.actor.lock().expect("actor lock poisoned");

    let pending: Vec<i32> = std::mem::take(
        &mut *service
            .pending_signals
            .lock()
            .expect("signal queue lock poisoned"),
    );
    for signal in pending {
        actor.signal(signal);
    }

    if service.profile {
        let start = thread_cpu_us();
        service.cpu_start_us.store(start, Ordering::Relaxed);
        actor.dispatch(&ctx, message);
        let spent = thread_cpu_us().saturating_sub(start);
        service.cpu_cost_us.fetch_add(spent, Ordering::Relaxed);
    } else {
        actor.dispatch(&ctx, message);
    }

    CURRENT_HANDLE.with(|c| c.set(0));
}

/// What a handler sees of the runtime: its own identity plus the send,
/// command, and timer surfaces. Socket operations live in `crate::socket`.
pub struct Context {
    pub(crate) service: Arc<Service>,
}

impl Context {
    pub fn handle(&self) -> Handle {
        self.service.handle()
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        self.service.node()
    }

    pub fn alloc_session(&self) -> i32 {
        self.service.alloc_session()
    }

    /// Send a message from this service. `session` pairs a future reply; use
    /// 0 when no reply is expected. Returns the session on success.
    pub fn send(
        &self,
        destination: Handle,
        kind: MessageKind,
        session: i32,
        payload: Vec<u8>,
    ) -> Result<i32, Error> {
        self.node()
            .send(self.handle(), destination, kind, session, payload)
    }

    /// Send with a freshly allocated session, returning it so the reply can
    /// be matched.
    pub fn request(
        &self,
        destination: Handle,
        kind: MessageKind,
        payload: Vec<u8>,
    ) -> Result<i32, Error> {
        let session = self.alloc_session();
        self.send(destination, kind, session, payload)
    }

    /// Send to a `:hex` or `.name` address.
    pub fn send_name(
        &self,
        name: &str,
        kind: MessageKind,
        session: i32,
        payload: Vec<u8>,
    ) -> Result<i32, Error> {
        let destination = crate::harbor::address_to_handle(self.node(), name)?;
        self.send(destination, kind, session, payload)
    }

    /// Run a control command (see `crate::command` for the verb table).
    pub fn command(&self, cmd: &str, param: &str) -> Option<String> {
        crate::command::command(self.node(), &self.service, cmd, param)
    }

    /// Schedule a `Response` to this service after `ticks` hundredths of a
    /// second; returns the session that will arrive with it.
    pub fn timeout(&self, ticks: i32) -> i32 {
        let session = self.alloc_session();
        self.node().timeout(self.handle(), ticks, session);
        session
    }

    /// Ticks since the runtime started.
    pub fn now(&self) -> u64 {
        self.node().timer().now()
    }

    /// Write a line through the in-band error channel (the logger service).
    pub fn error(&self, text: &str) {
        crate::log::error_to(self.node(), self.handle(), text.to_string());
    }

    /// Exit this service after the current message.
    pub fn exit(&self) {
        self.node().handle_exit(self.handle(), Handle::ZERO);
    }
}

pub(crate) fn thread_cpu_us() -> u64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_THREAD_CPUTIME_ID) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000,
        Err(_) => 0,
    }
}
