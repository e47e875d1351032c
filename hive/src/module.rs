// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Service types. A `Module` is a named factory for actors; the registry
//! replaces a dynamic-library search path with build-time registration, so
//! service creation never touches the file system.

use std::sync::{Arc, Mutex};

use crate::message::Message;
use crate::service::Context;
use crate::Error;

/// At most this many distinct service types can be registered.
const MAX_MODULE: usize = 32;

/// The behavior of one service instance. `release` from the original
/// four-symbol ABI is `Drop`; everything else maps one to one.
pub trait Actor: Send {
    /// Runs once, on the launching thread, before any message is delivered.
    /// The textual `args` come verbatim from the LAUNCH command. A non-Ok
    /// result aborts the launch and the service never dispatches.
    fn init(&mut self, ctx: &Context, args: &str) -> Result<(), Error>;

    /// Handle one message. Never runs concurrently with itself for the same
    /// service, so `&mut self` state needs no further locking. The message
    /// payload is owned; move it out to keep it past the call.
    fn dispatch(&mut self, ctx: &Context, message: Message);

    /// Out-of-band signal (the SIGNAL command). Delivered before the next
    /// dispatch when the actor is currently running a message.
    fn signal(&mut self, _signal: i32) {}
}

/// A named service type.
pub trait Module: Send + Sync {
    fn create(&self) -> Box<dyn Actor>;
}

/// Any factory closure is a module.
impl<F> Module for F
where
    F: Fn() -> Box<dyn Actor> + Send + Sync,
{
    fn create(&self) -> Box<dyn Actor> {
        self()
    }
}

/// Name → module table. Registration happens before boot; `query` is the
/// hot path and only takes the lock briefly.
pub struct ModuleRegistry {
    modules: Mutex<Vec<(String, Arc<dyn Module>)>>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry {
            modules: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, name: &str, module: Arc<dyn Module>) -> Result<(), Error> {
        let mut modules = self.modules.lock().expect("module table lock poisoned");

        if modules.len() >= MAX_MODULE {
            return Err(Error::ModuleTableFull);
        }
        if modules.iter().any(|(n, _)| n == name) {
            return Err(Error::ModuleExists(name.to_string()));
        }

        modules.push((name.to_string(), module));
        Ok(())
    }

    pub fn query(&self, name: &str) -> Option<Arc<dyn Module>> {
        let modules = self.modules.lock().expect("module table lock poisoned");
        modules
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m.clone())
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl Actor for Nop {
        fn init(&mut self, _ctx: &Context, _args: &str) -> Result<(), Error> {
            Ok(())
        }
        fn dispatch(&mut self, _ctx: &Context, _message: Message) {}
    }

    #[test]
    fn register_and_query() {
        let registry = ModuleRegistry::new();
        registry
            .register("nop", Arc::new(|| Box::new(Nop) as Box<dyn Actor>))
            .unwrap();

        assert!(registry.query("nop").is_some());
        assert!(registry.query("missing").is_none());
        assert!(registry
            .register("nop", Arc::new(|| Box::new(Nop) as Box<dyn Actor>))
            .is_err());
    }

    #[test]
    fn table_is_bounded() {
        let registry = ModuleRegistry::new();
        for i in 0..MAX_MODULE {
            registry
                .register(&format!("m{i}"), Arc::new(|| Box::new(Nop) as Box<dyn Actor>))
                .unwrap();
        }
        assert!(registry
            .register("one-too-many", Arc::new(|| Box::new(Nop) as Box<dyn Actor>))
            .is_err());
    }
}
