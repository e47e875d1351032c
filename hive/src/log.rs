// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Error and message-log sinks. Runtime errors are themselves messages:
//! they are delivered as `Text` to the service named "logger", falling back
//! to the process logger while none is registered.

use log::*;

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use crate::handle::Handle;
use crate::message::{Message, MessageKind};
use crate::node::Node;

/// Route one error line through the logger service. `source` is the service
/// the line is about (zero for the runtime itself).
pub(crate) fn error_to(node: &Node, source: Handle, text: String) {
    let Some(logger) = node.find_name("logger") else {
        error!("{text}");
        return;
    };

    let delivered = node.push_message(
        logger,
        Message {
            source,
            session: 0,
            kind: MessageKind::Text,
            payload: text.clone().into_bytes(),
        },
    );

    if delivered.is_err() {
        error!("{text}");
    }
}

/// Path of the per-service message log opened by LOGON.
pub(crate) fn message_log_path(logpath: &str, handle: Handle) -> PathBuf {
    PathBuf::from(logpath).join(format!("{:08x}.log", handle.raw()))
}

/// Append one dispatched message to a service's message log: source,
/// session, kind, tick, then the payload in hex.
pub(crate) fn write_record(file: &mut File, message: &Message, now: u64) {
    let mut line = format!(
        "{} {} {} {} ",
        message.source,
        message.session,
        message.kind.as_u8(),
        now
    );
    for byte in &message.payload {
        line.push_str(&format!("{byte:02x}"));
    }
    line.push('\n');

    if let Err(e) = file.write_all(line.as_bytes()) {
        warn!("message log write failed: {e}");
    }
}
