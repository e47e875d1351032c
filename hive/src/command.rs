// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The text command surface. Commands are addressed to the runtime, not to
//! user services; each returns a short string or nothing.

use std::sync::Arc;

use crate::handle::Handle;
use crate::node::Node;
use crate::service::Service;

/// Execute one command on behalf of `service`. Unknown verbs and failed
/// commands return `None`.
pub(crate) fn command(
    node: &Arc<Node>,
    service: &Arc<Service>,
    cmd: &str,
    param: &str,
) -> Option<String> {
    match cmd {
        "TIMEOUT" => cmd_timeout(node, service, param),
        "REG" => cmd_reg(node, service, param),
        "QUERY" => cmd_query(node, param),
        "NAME" => cmd_name(node, param),
        "EXIT" => {
            node.handle_exit(service.handle(), Handle::ZERO);
            None
        }
        "KILL" => {
            let target = parse_address(node, param)?;
            node.handle_exit(service.handle(), target);
            None
        }
        "LAUNCH" => cmd_launch(node, param),
        "GETENV" => node.env().get(param),
        "SETENV" => cmd_setenv(node, param),
        "STARTTIME" => Some(node.timer().starttime().to_string()),
        "ABORT" => {
            node.retire_all();
            None
        }
        "MONITOR" => cmd_monitor(node, param),
        "STAT" => cmd_stat(service, param),
        "LOGON" => cmd_logon(node, param),
        "LOGOFF" => cmd_logoff(node, param),
        "SIGNAL" => cmd_signal(node, param),
        _ => None,
    }
}

fn cmd_timeout(node: &Arc<Node>, service: &Arc<Service>, param: &str) -> Option<String> {
    let ticks: i32 = param.trim().parse().ok()?;
    let session = service.alloc_session();
    node.timeout(service.handle(), ticks, session);
    Some(session.to_string())
}

fn cmd_reg(node: &Arc<Node>, service: &Arc<Service>, param: &str) -> Option<String> {
    if param.is_empty() {
        return Some(service.handle().to_string());
    }

    let name = param.strip_prefix('.')?;
    if node.bind_name(name, service.handle()) {
        Some(param.to_string())
    } else {
        None
    }
}

fn cmd_query(node: &Arc<Node>, param: &str) -> Option<String> {
    let name = param.strip_prefix('.')?;
    node.find_name(name).map(|h| h.to_string())
}

fn cmd_name(node: &Arc<Node>, param: &str) -> Option<String> {
    let (name, handle) = param.split_once(' ')?;
    let name = name.strip_prefix('.')?;
    let handle = Handle::parse_hex(handle.trim())?;

    if node.bind_name(name, handle) {
        Some(format!(".{name}"))
    } else {
        None
    }
}

fn cmd_launch(node: &Arc<Node>, param: &str) -> Option<String> {
    let param = param.trim();
    let (module, args) = match param.split_once(char::is_whitespace) {
        Some((module, args)) => (module, args.trim()),
        None => (param, ""),
    };
    if module.is_empty() {
        return None;
    }

    match node.launch(module, args) {
        Ok(handle) => Some(handle.to_string()),
        Err(e) => {
            crate::log::error_to(node, Handle::ZERO, format!("launch {param} failed: {e}"));
            None
        }
    }
}

fn cmd_setenv(node: &Arc<Node>, param: &str) -> Option<String> {
    let (key, value) = param.split_once(' ')?;
    node.env().set(key, value);
    None
}

fn cmd_monitor(node: &Arc<Node>, param: &str) -> Option<String> {
    if param.is_empty() {
        let current = node.monitor_exit();
        if current.is_zero() {
            return None;
        }
        return Some(current.to_string());
    }

    let handle = parse_address(node, param)?;
    node.set_monitor_exit(handle);
    None
}

fn cmd_stat(service: &Arc<Service>, param: &str) -> Option<String> {
    let value = match param.trim() {
        "mqlen" => service.mailbox().len().to_string(),
        "endless" => {
            if service.take_endless() {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        "cpu" => format!("{:.6}", service.cpu_cost_us() as f64 / 1_000_000.0),
        "time" => {
            if service.profile() {
                format!("{:.6}", service.dispatch_cpu_us() as f64 / 1_000_000.0)
            } else {
                "0".to_string()
            }
        }
        "message" => service.message_count().to_string(),
        _ => "0".to_string(),
    };
    Some(value)
}

fn cmd_logon(node: &Arc<Node>, param: &str) -> Option<String> {
    let handle = parse_address(node, param)?;
    let service = node.grab(handle)?;

    let path = crate::log::message_log_path(&node.logpath(), handle);
    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => {
            service.open_message_log(file);
            crate::log::error_to(node, handle, format!("open log file {}", path.display()));
            Some(path.display().to_string())
        }
        Err(e) => {
            crate::log::error_to(
                node,
                handle,
                format!("open log file {} failed: {e}", path.display()),
            );
            None
        }
    }
}

fn cmd_logoff(node: &Arc<Node>, param: &str) -> Option<String> {
    let handle = parse_address(node, param)?;
    let service = node.grab(handle)?;
    service.close_message_log();
    None
}

fn cmd_signal(node: &Arc<Node>, param: &str) -> Option<String> {
    let (address, signal) = match param.split_once(' ') {
        Some((address, signal)) => (address, signal.trim().parse().ok()?),
        None => (param, 0),
    };

    let handle = parse_address(node, address)?;
    let service = node.grab(handle)?;
    service.deliver_signal(signal);
    None
}

/// `:hex` or `.name`; anything else is the caller's problem.
fn parse_address(node: &Node, text: &str) -> Option<Handle> {
    let text = text.trim();
    if let Some(handle) = Handle::parse_hex(text) {
        return Some(handle);
    }
    if let Some(name) = text.strip_prefix('.') {
        return node.find_name(name);
    }
    None
}
