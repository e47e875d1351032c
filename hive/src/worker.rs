// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The worker dispatch loop and the per-worker weight policy.

use std::sync::Arc;

use crate::handle::Handle;
use crate::mailbox::Mailbox;
use crate::monitor::WorkerWatch;
use crate::node::Node;
use crate::service::dispatch_message;

/// Batch policy per worker index, matching the reference schedule: the
/// first four workers hand the mailbox back after every message, the next
/// four drain it, and later workers take a shrinking fraction so busy
/// mailboxes re-enter the run queue often.
pub(crate) fn weight_for(index: usize) -> i32 {
    match index {
        0..=3 => -1,
        4..=7 => 0,
        8..=15 => 1,
        16..=23 => 2,
        24..=31 => 3,
        _ => 0,
    }
}

pub(crate) fn worker_main(node: Arc<Node>, watch: Arc<WorkerWatch>, weight: i32) {
    let mut mailbox: Option<Arc<Mailbox>> = None;

    loop {
        mailbox = dispatch_batch(&node, mailbox, weight, &watch);

        if mailbox.is_none() {
            if !node.worker_sleep() {
                break;
            }
        }
    }
}

/// Dispatch up to one batch from one mailbox; returns the mailbox to
/// continue with, or `None` when the run queue is empty.
///
/// Popping the mailbox from the run queue confers the exclusive right to
/// dispatch its service until it is pushed back or drained empty, which is
/// what keeps a handler from ever racing itself.
fn dispatch_batch(
    node: &Arc<Node>,
    mailbox: Option<Arc<Mailbox>>,
    weight: i32,
    watch: &WorkerWatch,
) -> Option<Arc<Mailbox>> {
    let mailbox = match mailbox {
        Some(mailbox) => mailbox,
        None => node.global().pop()?,
    };

    let handle = mailbox.handle();
    let Some(service) = node.grab(handle) else {
        if mailbox.release_pending() {
            // The service is gone; every remaining message bounces back to
            // its sender as an error.
            node.drain_with_errors(&mailbox);
        } else {
            // Retirement in progress: the slot is already empty but the
            // release flag is not up yet. Requeue and let the next pass
            // see the flag.
            node.global().push(mailbox);
        }
        return node.global().pop();
    };

    let mut batch = 1usize;
    let mut i = 0usize;
    while i < batch {
        let Some(message) = mailbox.pop() else {
            // Drained empty: the pop already took it off the run queue.
            return node.global().pop();
        };

        if i == 0 && weight >= 0 {
            batch = mailbox.len() >> weight as u32;
        }

        let overload = mailbox.overload();
        if overload > 0 {
            crate::log::error_to(
                node,
                handle,
                format!("may overload, message queue length = {overload}"),
            );
        }

        watch.trigger(message.source, handle);
        dispatch_message(&service, message);
        watch.trigger(Handle::ZERO, Handle::ZERO);

        // A handler that fanned out work should wake a peer immediately
        // rather than wait for the timer heartbeat.
        node.signal_worker();

        i += 1;
    }

    match node.global().pop() {
        Some(next) => {
            // Someone else is waiting: hand our mailbox to the back of the
            // queue and take theirs.
            node.global().push(mailbox);
            Some(next)
        }
        None => Some(mailbox),
    }
}
