// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-worker stall watchdogs. Each worker stamps a version before every
//! dispatch; a sampling thread that sees the same version twice while a
//! destination is recorded concludes that dispatch never returned.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::handle::Handle;
use crate::node::Node;

pub(crate) struct WorkerWatch {
    version: AtomicU32,
    check_version: AtomicU32,
    source: AtomicU32,
    destination: AtomicU32,
}

impl WorkerWatch {
    pub fn new() -> WorkerWatch {
        WorkerWatch {
            version: AtomicU32::new(0),
            check_version: AtomicU32::new(0),
            source: AtomicU32::new(0),
            destination: AtomicU32::new(0),
        }
    }

    /// Stamp the message about to be dispatched (or zeros after it
    /// returned).
    pub fn trigger(&self, source: Handle, destination: Handle) {
        self.source.store(source.raw(), Ordering::Relaxed);
        self.destination.store(destination.raw(), Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// One sampling pass. No progress since the last pass while a dispatch
    /// was in flight means the handler is stuck.
    pub fn check(&self, node: &Node) {
        let version = self.version.load(Ordering::Acquire);

        if version != self.check_version.load(Ordering::Relaxed) {
            self.check_version.store(version, Ordering::Relaxed);
            return;
        }

        let destination = Handle::new(self.destination.load(Ordering::Relaxed));
        if destination.is_zero() {
            return;
        }

        let source = Handle::new(self.source.load(Ordering::Relaxed));
        if let Some(service) = node.grab(destination) {
            service.mark_endless();
        }
        crate::log::error_to(
            node,
            Handle::ZERO,
            format!(
                "a message from [ {source} ] to [ {destination} ] may be in an endless loop (version = {version})"
            ),
        );
    }
}
