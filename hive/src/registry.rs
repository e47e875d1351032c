// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The identity registry: allocates 24-bit local slots, resolves handles to
//! live services, and keeps the append-only name table.

use std::sync::{Arc, RwLock};

use crate::handle::{Handle, HANDLE_MASK};
use crate::service::Service;
use crate::Error;

const INITIAL_SLOTS: usize = 4;

struct Inner {
    /// Open-addressed: a handle's low bits modulo the (power-of-two) slot
    /// count give its index. Doubling rehashes every live service, and every
    /// handle keeps landing on its own slot because the candidate counter
    /// never hands out two handles that collide in the larger table.
    slots: Vec<Option<Arc<Service>>>,
    /// Next candidate handle value (low 24 bits only).
    handle_index: u32,
    /// Sorted by name for binary search; names are never rebound.
    names: Vec<(String, Handle)>,
}

pub struct Registry {
    node_id: u8,
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new(node_id: u8) -> Registry {
        let mut slots = Vec::with_capacity(INITIAL_SLOTS);
        slots.resize_with(INITIAL_SLOTS, || None);

        Registry {
            node_id,
            inner: RwLock::new(Inner {
                slots,
                handle_index: 1,
                names: Vec::new(),
            }),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Allocate a slot and install the service built by `build`, which
    /// receives the final handle. The build runs under the write lock, so it
    /// must not call back into the registry.
    pub fn register_with<F>(&self, build: F) -> Result<Arc<Service>, Error>
    where
        F: FnOnce(Handle) -> Arc<Service>,
    {
        let mut inner = self.inner.write().expect("registry lock poisoned");

        loop {
            let size = inner.slots.len() as u32;
            let mut candidate = inner.handle_index;

            for _ in 0..size {
                if candidate > HANDLE_MASK {
                    // Wrapped; 0 is reserved.
                    candidate = 1;
                }

                let index = (candidate & (size - 1)) as usize;
                if inner.slots[index].is_none() {
                    let handle = Handle::new(((self.node_id as u32) << 24) | candidate);
                    let service = build(handle);
                    inner.slots[index] = Some(service.clone());
                    inner.handle_index = candidate + 1;
                    return Ok(service);
                }

                candidate += 1;
            }

            // Full at this size: double and rehash, or give up at 2^24.
            if size * 2 > HANDLE_MASK + 1 {
                return Err(Error::RegistryFull);
            }

            let new_size = (size * 2) as usize;
            let mut slots: Vec<Option<Arc<Service>>> = Vec::with_capacity(new_size);
            slots.resize_with(new_size, || None);

            for service in inner.slots.iter_mut().filter_map(Option::take) {
                let index = (service.handle().slot() & (new_size as u32 - 1)) as usize;
                debug_assert!(slots[index].is_none());
                slots[index] = Some(service);
            }
            inner.slots = slots;
        }
    }

    /// Resolve a handle into a lease on the service. The clone happens under
    /// the read lock, so the service cannot be destroyed while any lease is
    /// held.
    pub fn grab(&self, handle: Handle) -> Option<Arc<Service>> {
        if handle.is_zero() {
            return None;
        }

        let inner = self.inner.read().expect("registry lock poisoned");
        let index = (handle.slot() & (inner.slots.len() as u32 - 1)) as usize;

        match &inner.slots[index] {
            Some(service) if service.handle() == handle => Some(service.clone()),
            _ => None,
        }
    }

    /// Remove a handle and its names. The registry's own reference is
    /// returned so the caller can drop it after the lock is released; a
    /// service destructor must never run under the registry lock.
    pub fn retire(&self, handle: Handle) -> Option<Arc<Service>> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let index = (handle.slot() & (inner.slots.len() as u32 - 1)) as usize;

        let matches = matches!(&inner.slots[index], Some(s) if s.handle() == handle);
        if !matches {
            return None;
        }

        let service = inner.slots[index].take();
        inner.names.retain(|(_, h)| *h != handle);
        service
    }

    /// Handles of every live service.
    pub fn live_handles(&self) -> Vec<Handle> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .slots
            .iter()
            .flatten()
            .map(|service| service.handle())
            .collect()
    }

    /// Bind `name` to a handle. Names are append-only: a second bind of the
    /// same name fails.
    pub fn bind_name(&self, name: &str, handle: Handle) -> bool {
        let mut inner = self.inner.write().expect("registry lock poisoned");

        match inner.names.binary_search_by(|(n, _)| n.as_str().cmp(name)) {
            Ok(_) => false,
            Err(at) => {
                inner.names.insert(at, (name.to_string(), handle));
                true
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<Handle> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .names
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|at| inner.names[at].1)
    }
}
