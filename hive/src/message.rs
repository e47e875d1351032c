// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use crate::handle::Handle;

/// Payload sizes must leave the top 8 bits of a machine word free, where the
/// wire format packs the message kind.
pub const MAX_MESSAGE_SIZE: usize = usize::MAX >> 8;

/// The 8-bit message class carried on the wire. The numeric values are part
/// of the external protocol and must not be renumbered.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MessageKind {
    /// Free-form text, notably runtime error lines routed to the logger.
    Text = 0,
    /// Reply to a session opened by TIMEOUT or a request send.
    Response = 1,
    /// Application traffic between services.
    Client = 3,
    /// Runtime-internal notifications (service exits).
    System = 4,
    /// Envelope destined for another cluster node.
    Harbor = 5,
    /// Socket engine events (see `socket::SocketMessage`).
    Socket = 6,
    /// Delivery failure notice carrying the failed session.
    Error = 7,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<MessageKind> {
        Some(match v {
            0 => MessageKind::Text,
            1 => MessageKind::Response,
            3 => MessageKind::Client,
            4 => MessageKind::System,
            5 => MessageKind::Harbor,
            6 => MessageKind::Socket,
            7 => MessageKind::Error,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One queued message. The payload is owned: it transfers to the handler on
/// dispatch and is freed when the handler drops it (a handler that wants to
/// keep it simply moves it out).
#[derive(Debug)]
pub struct Message {
    pub source: Handle,
    pub session: i32,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    /// The delivery-failure notice sent back to a message's source when its
    /// destination is gone.
    pub(crate) fn delivery_error(failed_destination: Handle, session: i32) -> Message {
        Message {
            source: failed_destination,
            session,
            kind: MessageKind::Error,
            payload: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_numbers_are_wire_stable() {
        for kind in [
            MessageKind::Text,
            MessageKind::Response,
            MessageKind::Client,
            MessageKind::System,
            MessageKind::Harbor,
            MessageKind::Socket,
            MessageKind::Error,
        ] {
            assert_eq!(MessageKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(MessageKind::from_u8(2), None);
        assert_eq!(MessageKind::from_u8(8), None);
    }
}
