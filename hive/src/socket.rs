// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Bridge between the socket engine and services: engine events become
//! `Socket`-kind messages in the owner's mailbox, and `Context` grows the
//! socket operations.

use log::*;

use socket_server::{SocketEvent, UdpAddress};

use std::sync::Arc;

use crate::handle::Handle;
use crate::message::{Message, MessageKind};
use crate::node::Node;
use crate::service::Context;
use crate::Error;

/// What happened, as seen by the owning service. The numeric values ride in
/// the first payload byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SocketNotice {
    /// `ud` is the byte count; `data` is the bytes.
    Data = 1,
    /// Connection established / resumed / transferred; `data` is the peer
    /// address string when known.
    Open = 2,
    Close = 3,
    /// `ud` is the new socket ID; `data` is the peer address string.
    Accept = 4,
    /// `data` is the error text.
    Error = 5,
    /// `ud` is the datagram size; `data` is the datagram with the packed
    /// sender address appended.
    Udp = 6,
    /// `ud` is the queued KiB count.
    Warning = 7,
}

impl SocketNotice {
    fn from_u8(v: u8) -> Option<SocketNotice> {
        Some(match v {
            1 => SocketNotice::Data,
            2 => SocketNotice::Open,
            3 => SocketNotice::Close,
            4 => SocketNotice::Accept,
            5 => SocketNotice::Error,
            6 => SocketNotice::Udp,
            7 => SocketNotice::Warning,
            _ => return None,
        })
    }
}

/// The decoded payload of a `MessageKind::Socket` message.
#[derive(Debug)]
pub struct SocketMessage {
    pub notice: SocketNotice,
    pub id: i32,
    pub ud: i32,
    pub data: Vec<u8>,
}

impl SocketMessage {
    /// Payload layout: notice byte, id (LE), ud (LE), data.
    pub fn encode(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.data.len());
        out.push(self.notice as u8);
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.ud.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(payload: &[u8]) -> Option<SocketMessage> {
        if payload.len() < 9 {
            return None;
        }

        Some(SocketMessage {
            notice: SocketNotice::from_u8(payload[0])?,
            id: i32::from_le_bytes(payload[1..5].try_into().ok()?),
            ud: i32::from_le_bytes(payload[5..9].try_into().ok()?),
            data: payload[9..].to_vec(),
        })
    }

    /// For a `Udp` notice: the datagram and the sender address.
    pub fn udp_parts(&self) -> Option<(&[u8], UdpAddress)> {
        if self.notice != SocketNotice::Udp {
            return None;
        }

        let datagram = self.data.get(..self.ud as usize)?;
        let (address, _) = UdpAddress::decode(&self.data[self.ud as usize..])?;
        Some((datagram, address))
    }
}

/// Turn one engine event into a mailbox message. Returns `false` on `Exit`.
pub(crate) fn forward_event(node: &Arc<Node>, event: SocketEvent) -> bool {
    let (opaque, message) = match event {
        SocketEvent::Exit => return false,
        SocketEvent::Data { id, opaque, data } => (
            opaque,
            SocketMessage {
                notice: SocketNotice::Data,
                id,
                ud: data.len() as i32,
                data: data.into_vec(),
            },
        ),
        SocketEvent::Open { id, opaque, addr } => (
            opaque,
            SocketMessage {
                notice: SocketNotice::Open,
                id,
                ud: 0,
                data: addr.into_bytes(),
            },
        ),
        SocketEvent::Close { id, opaque } => (
            opaque,
            SocketMessage {
                notice: SocketNotice::Close,
                id,
                ud: 0,
                data: Vec::new(),
            },
        ),
        SocketEvent::Accept {
            id,
            opaque,
            new_id,
            addr,
        } => (
            opaque,
            SocketMessage {
                notice: SocketNotice::Accept,
                id,
                ud: new_id,
                data: addr.into_bytes(),
            },
        ),
        SocketEvent::Error { id, opaque, err } => (
            opaque,
            SocketMessage {
                notice: SocketNotice::Error,
                id,
                ud: 0,
                data: err.into_bytes(),
            },
        ),
        SocketEvent::Udp {
            id,
            opaque,
            data,
            address,
        } => {
            let size = data.len();
            let mut blob = data.into_vec();
            blob.extend_from_slice(address.as_bytes());
            (
                opaque,
                SocketMessage {
                    notice: SocketNotice::Udp,
                    id,
                    ud: size as i32,
                    data: blob,
                },
            )
        }
        SocketEvent::Warning { id, opaque, kb } => (
            opaque,
            SocketMessage {
                notice: SocketNotice::Warning,
                id,
                ud: kb as i32,
                data: Vec::new(),
            },
        ),
    };

    let owner = Handle::new(opaque);
    let delivered = node.push_message(
        owner,
        Message {
            source: Handle::ZERO,
            session: 0,
            kind: MessageKind::Socket,
            payload: message.encode(),
        },
    );

    if delivered.is_err() {
        debug!("socket event for retired service {owner} dropped");
    }
    true
}

impl Context {
    /// Listen on `host:port`; returns the socket ID and the bound port
    /// (useful when 0 was requested). The socket stays quiet until
    /// `socket_start`.
    pub fn socket_listen(&self, host: &str, port: u16, backlog: i32) -> Result<(i32, u16), Error> {
        let (id, addr) = self
            .node()
            .socket()
            .listen(self.handle().raw(), host, port, backlog)?;
        Ok((id, addr.port()))
    }

    /// Non-blocking connect; the outcome arrives as an Open or Error notice.
    pub fn socket_connect(&self, host: &str, port: u16) -> Result<i32, Error> {
        Ok(self.node().socket().connect(self.handle().raw(), host, port)?)
    }

    /// Resume delivery (and claim ownership) of a socket.
    pub fn socket_start(&self, id: i32) {
        self.node().socket().start(self.handle().raw(), id);
    }

    pub fn socket_pause(&self, id: i32) {
        self.node().socket().pause(self.handle().raw(), id);
    }

    pub fn socket_send(&self, id: i32, data: Vec<u8>) -> Result<(), Error> {
        Ok(self.node().socket().send(id, data)?)
    }

    pub fn socket_send_lowpriority(&self, id: i32, data: Vec<u8>) -> Result<(), Error> {
        Ok(self.node().socket().send_lowpriority(id, data)?)
    }

    /// Graceful close: queued data drains first.
    pub fn socket_close(&self, id: i32) {
        self.node().socket().close(self.handle().raw(), id);
    }

    /// Immediate close.
    pub fn socket_shutdown(&self, id: i32) {
        self.node().socket().shutdown(self.handle().raw(), id);
    }

    pub fn socket_nodelay(&self, id: i32) {
        self.node().socket().nodelay(id);
    }

    /// Adopt an existing fd (stdin, a socketpair end) as a socket.
    pub fn socket_bind_fd(&self, fd: std::os::fd::RawFd) -> Result<i32, Error> {
        Ok(self.node().socket().bind(self.handle().raw(), fd)?)
    }

    /// Create a UDP socket; bound when `host` is non-empty.
    pub fn socket_udp(&self, host: &str, port: u16) -> Result<(i32, u16), Error> {
        let (id, addr) = self.node().socket().udp(self.handle().raw(), host, port)?;
        Ok((id, addr.port()))
    }

    /// Set the current peer used by plain sends on a UDP socket.
    pub fn socket_udp_connect(&self, id: i32, host: &str, port: u16) -> Result<(), Error> {
        Ok(self.node().socket().udp_connect(id, host, port)?)
    }

    /// Send one datagram to an explicit address.
    pub fn socket_udp_send(
        &self,
        id: i32,
        address: &UdpAddress,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        Ok(self.node().socket().udp_send(id, Some(address), data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_message_round_trip() {
        let encoded = SocketMessage {
            notice: SocketNotice::Accept,
            id: 3,
            ud: 9,
            data: b"127.0.0.1:4000".to_vec(),
        }
        .encode();

        let decoded = SocketMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.notice, SocketNotice::Accept);
        assert_eq!(decoded.id, 3);
        assert_eq!(decoded.ud, 9);
        assert_eq!(decoded.data, b"127.0.0.1:4000");
    }

    #[test]
    fn udp_parts_split_datagram_and_address() {
        let peer: std::net::SocketAddr = "127.0.0.1:5353".parse().unwrap();
        let address = UdpAddress::from(peer);

        let mut data = b"dgram".to_vec();
        data.extend_from_slice(address.as_bytes());

        let message = SocketMessage {
            notice: SocketNotice::Udp,
            id: 1,
            ud: 5,
            data,
        };

        let (datagram, decoded) = message.udp_parts().unwrap();
        assert_eq!(datagram, b"dgram");
        assert_eq!(decoded.to_socket_addr().unwrap(), peer);
    }
}
