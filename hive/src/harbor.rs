// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Remote-destination classification. The core never talks to the network
//! for cross-node traffic; it re-addresses the envelope to a distinguished
//! remote-forwarder service installed at startup.

use std::sync::Arc;

use crate::handle::Handle;
use crate::message::MessageKind;
use crate::node::Node;
use crate::Error;

/// Install `remote` as the forwarder for cross-node envelopes. The service
/// stays registered but no longer counts toward the shutdown predicate, so
/// an idle node can still quit with its forwarder alive.
pub fn start(node: &Arc<Node>, remote: Handle) -> Result<(), Error> {
    let service = node.grab(remote).ok_or(Error::InvalidHandle(remote))?;
    node.reserve(service);
    Ok(())
}

/// Envelope layout handed to the forwarder: destination (LE), original kind,
/// then the payload.
pub fn encode_remote(destination: Handle, kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.extend_from_slice(&destination.raw().to_le_bytes());
    out.push(kind.as_u8());
    out.extend_from_slice(payload);
    out
}

pub fn decode_remote(payload: &[u8]) -> Option<(Handle, MessageKind, &[u8])> {
    if payload.len() < 5 {
        return None;
    }

    let destination = Handle::new(u32::from_le_bytes(payload[..4].try_into().ok()?));
    let kind = MessageKind::from_u8(payload[4])?;
    Some((destination, kind, &payload[5..]))
}

/// Resolve a `:hex` or `.name` destination. Any other form is reported to
/// the caller as an error rather than guessed at.
pub(crate) fn address_to_handle(node: &Node, name: &str) -> Result<Handle, Error> {
    if let Some(handle) = Handle::parse_hex(name) {
        return Ok(handle);
    }
    if let Some(local) = name.strip_prefix('.') {
        return node
            .find_name(local)
            .ok_or_else(|| Error::BadAddress(name.to_string()));
    }
    Err(Error::BadAddress(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let destination = Handle::new(0x0200_0005);
        let encoded = encode_remote(destination, MessageKind::Client, b"abc");
        let (d, kind, rest) = decode_remote(&encoded).unwrap();

        assert_eq!(d, destination);
        assert_eq!(kind, MessageKind::Client);
        assert_eq!(rest, b"abc");
    }

    #[test]
    fn short_envelope_rejected() {
        assert!(decode_remote(&[1, 2, 3]).is_none());
    }
}
