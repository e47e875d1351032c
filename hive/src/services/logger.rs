// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The default log service. Error lines from anywhere in the runtime arrive
//! here as `Text` messages and are written to stderr, or to the file named
//! by the launch argument.

use std::fs::{File, OpenOptions};
use std::io::Write;

use crate::message::{Message, MessageKind};
use crate::module::{Actor, Module};
use crate::service::Context;
use crate::Error;

pub struct LoggerModule;

impl Module for LoggerModule {
    fn create(&self) -> Box<dyn Actor> {
        Box::new(Logger { output: None })
    }
}

struct Logger {
    /// `None` writes to stderr.
    output: Option<File>,
}

impl Actor for Logger {
    fn init(&mut self, _ctx: &Context, args: &str) -> Result<(), Error> {
        if !args.is_empty() {
            self.output = Some(OpenOptions::new().create(true).append(true).open(args)?);
        }
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &Context, message: Message) {
        match message.kind {
            MessageKind::Text | MessageKind::Error => {
                let text = String::from_utf8_lossy(&message.payload);
                let line = format!("[{}] {}\n", message.source, text);
                match self.output.as_mut() {
                    Some(file) => {
                        let _ = file.write_all(line.as_bytes());
                    }
                    None => eprint!("{line}"),
                }
            }
            _ => {}
        }
    }
}
