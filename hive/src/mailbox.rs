// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The two-level queue workers poll: a bounded-growth ring per service, and
//! one process-wide FIFO of the rings that currently hold messages.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::handle::Handle;
use crate::message::Message;

const DEFAULT_CAPACITY: usize = 64;
const OVERLOAD_THRESHOLD: usize = 1024;

struct Ring {
    buffer: Vec<Option<Message>>,
    head: usize,
    tail: usize,
    /// Present on the global run queue. A new mailbox starts with this set
    /// so pushes during service init cannot enqueue it early; whoever
    /// finishes the init pushes it explicitly.
    in_global: bool,
    /// The owning service is gone; the next worker to pop this mailbox
    /// drains it with the error-drop policy instead of dispatching.
    release: bool,
    /// Sticky high-water mark, reported once via `overload()`.
    overload: usize,
    overload_threshold: usize,
}

impl Ring {
    fn len(&self) -> usize {
        if self.tail >= self.head {
            self.tail - self.head
        } else {
            self.tail + self.buffer.len() - self.head
        }
    }

    fn grow(&mut self) {
        let old = self.buffer.len();
        let mut buffer: Vec<Option<Message>> = Vec::with_capacity(old * 2);
        buffer.resize_with(old * 2, || None);

        for (i, slot) in buffer.iter_mut().take(old).enumerate() {
            *slot = self.buffer[(self.head + i) % old].take();
        }

        self.head = 0;
        self.tail = old;
        self.buffer = buffer;
    }
}

/// Per-service message FIFO.
pub struct Mailbox {
    handle: Handle,
    ring: Mutex<Ring>,
}

impl Mailbox {
    pub fn new(handle: Handle) -> Arc<Mailbox> {
        let mut buffer = Vec::with_capacity(DEFAULT_CAPACITY);
        buffer.resize_with(DEFAULT_CAPACITY, || None);

        Arc::new(Mailbox {
            handle,
            ring: Mutex::new(Ring {
                buffer,
                head: 0,
                tail: 0,
                in_global: true,
                release: false,
                overload: 0,
                overload_threshold: OVERLOAD_THRESHOLD,
            }),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Append and, when this mailbox was idle, enqueue it on the run queue.
    pub fn push(self: &Arc<Self>, global: &GlobalQueue, message: Message) {
        let mut ring = self.ring.lock().expect("mailbox lock poisoned");

        let tail = ring.tail;
        ring.buffer[tail] = Some(message);
        ring.tail = (tail + 1) % ring.buffer.len();

        if ring.tail == ring.head {
            ring.grow();
        }

        if !ring.in_global {
            ring.in_global = true;
            global.push(self.clone());
        }
    }

    /// Take the oldest message. An empty mailbox leaves the run queue (the
    /// flag flips here, under the same lock a racing `push` takes) and its
    /// overload threshold resets.
    pub fn pop(&self) -> Option<Message> {
        let mut ring = self.ring.lock().expect("mailbox lock poisoned");

        if ring.head == ring.tail {
            ring.in_global = false;
            ring.overload_threshold = OVERLOAD_THRESHOLD;
            return None;
        }

        let head = ring.head;
        let message = ring.buffer[head].take();
        ring.head = (head + 1) % ring.buffer.len();

        let length = ring.len();
        while length > ring.overload_threshold {
            ring.overload = length;
            ring.overload_threshold *= 2;
        }

        message
    }

    pub fn len(&self) -> usize {
        self.ring.lock().expect("mailbox lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Report and clear the sticky overload mark.
    pub fn overload(&self) -> usize {
        let mut ring = self.ring.lock().expect("mailbox lock poisoned");
        std::mem::take(&mut ring.overload)
    }

    pub fn mark_release(&self) {
        self.ring.lock().expect("mailbox lock poisoned").release = true;
    }

    pub fn release_pending(&self) -> bool {
        self.ring.lock().expect("mailbox lock poisoned").release
    }

    /// Drain every remaining message through `drop_message`. Used when the
    /// owning service failed init or was retired.
    pub fn drain<F: FnMut(Message)>(&self, mut drop_message: F) {
        while let Some(message) = self.pop() {
            drop_message(message);
        }
    }
}

/// FIFO of mailboxes that currently hold messages; the only queue shared by
/// every worker.
pub struct GlobalQueue {
    queue: Mutex<VecDeque<Arc<Mailbox>>>,
}

impl GlobalQueue {
    pub fn new() -> GlobalQueue {
        GlobalQueue {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, mailbox: Arc<Mailbox>) {
        self.queue
            .lock()
            .expect("run queue lock poisoned")
            .push_back(mailbox);
    }

    pub fn pop(&self) -> Option<Arc<Mailbox>> {
        self.queue
            .lock()
            .expect("run queue lock poisoned")
            .pop_front()
    }
}

impl Default for GlobalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn message(session: i32) -> Message {
        Message {
            source: Handle::new(1),
            session,
            kind: MessageKind::Client,
            payload: Vec::new(),
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let global = GlobalQueue::new();
        let mailbox = Mailbox::new(Handle::new(2));

        for i in 0..10 {
            mailbox.push(&global, message(i));
        }
        for i in 0..10 {
            assert_eq!(mailbox.pop().unwrap().session, i);
        }
        assert!(mailbox.pop().is_none());
    }

    #[test]
    fn grows_exactly_when_full() {
        let global = GlobalQueue::new();
        let mailbox = Mailbox::new(Handle::new(2));

        for i in 0..DEFAULT_CAPACITY as i32 {
            mailbox.push(&global, message(i));
        }
        // 64 pushes fit; the 64th triggered the grow to 128, preserving
        // order.
        assert_eq!(mailbox.len(), DEFAULT_CAPACITY);
        mailbox.push(&global, message(64));
        assert_eq!(mailbox.len(), DEFAULT_CAPACITY + 1);

        for i in 0..=DEFAULT_CAPACITY as i32 {
            assert_eq!(mailbox.pop().unwrap().session, i);
        }
    }

    #[test]
    fn enqueues_on_global_once() {
        let global = GlobalQueue::new();
        let mailbox = Mailbox::new(Handle::new(2));

        // A fresh mailbox claims to be in the global queue, so init-time
        // pushes stay local:
        mailbox.push(&global, message(0));
        assert!(global.pop().is_none());

        // Popping to empty rearms the flag:
        assert!(mailbox.pop().is_some());
        assert!(mailbox.pop().is_none());

        mailbox.push(&global, message(1));
        mailbox.push(&global, message(2));
        let queued = global.pop().expect("mailbox enqueued on first push");
        assert_eq!(queued.handle(), mailbox.handle());
        // Only once for two pushes:
        assert!(global.pop().is_none());
    }

    #[test]
    fn overload_reports_and_doubles() {
        let global = GlobalQueue::new();
        let mailbox = Mailbox::new(Handle::new(2));

        for i in 0..1100 {
            mailbox.push(&global, message(i));
        }
        assert_eq!(mailbox.overload(), 0);

        // Crossing 1024 on pop records the length and doubles the bar.
        mailbox.pop();
        let reported = mailbox.overload();
        assert!(reported > 1024, "got {reported}");
        // Sticky value clears after the report:
        assert_eq!(mailbox.overload(), 0);
        // No new report until 2048 is crossed:
        mailbox.pop();
        assert_eq!(mailbox.overload(), 0);
    }
}
