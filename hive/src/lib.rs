// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A lightweight single-process actor runtime: thousands of isolated
//! services exchanging asynchronous messages, driven by a fixed pool of
//! worker threads, a timing wheel, and one event-driven I/O thread.
//!
//! Each service processes one message at a time and never blocks a worker;
//! all socket I/O goes through the `socket_server` engine, whose events come
//! back as ordinary messages.

use std::fmt;

pub mod command;
pub mod env;
pub mod handle;
pub mod harbor;
pub mod log;
pub mod mailbox;
pub mod message;
pub mod module;
pub mod monitor;
pub mod node;
pub mod registry;
pub mod service;
pub mod services;
pub mod socket;
pub mod timer;
pub mod worker;

pub use handle::Handle;
pub use message::{Message, MessageKind, MAX_MESSAGE_SIZE};
pub use module::{Actor, Module, ModuleRegistry};
pub use node::{start, Config, Node};
pub use service::{current_handle, Context};
pub use socket::{SocketMessage, SocketNotice};

/// Errors observable at the runtime boundary.
#[derive(Debug)]
pub enum Error {
    /// Send to handle 0 or to a retired handle.
    InvalidHandle(Handle),
    /// Payload too big for the packed type+size word.
    MessageTooLarge(usize),
    /// LAUNCH named an unregistered module.
    ModuleNotFound(String),
    /// The module's init rejected the launch.
    ModuleInitFailed(String),
    /// A module name was registered twice.
    ModuleExists(String),
    /// The 32-entry module table is full.
    ModuleTableFull,
    /// All 2^24 handles are live.
    RegistryFull,
    /// A destination string was neither `:hex` nor a known `.name`.
    BadAddress(String),
    Socket(socket_server::Error),
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidHandle(h) => write!(f, "invalid handle {h}"),
            Self::MessageTooLarge(sz) => write!(f, "message of {sz} bytes is too large"),
            Self::ModuleNotFound(name) => write!(f, "module {name} is not registered"),
            Self::ModuleInitFailed(name) => write!(f, "init of module {name} failed"),
            Self::ModuleExists(name) => write!(f, "module {name} already registered"),
            Self::ModuleTableFull => write!(f, "module table is full"),
            Self::RegistryFull => write!(f, "no free service handles"),
            Self::BadAddress(name) => write!(f, "bad address {name}"),
            Self::Socket(e) => write!(f, "socket error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<socket_server::Error> for Error {
    fn from(e: socket_server::Error) -> Self {
        Self::Socket(e)
    }
}
