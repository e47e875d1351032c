// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Control-pipe framing between worker threads and the I/O thread.
//!
//! Every frame is `{tag(1), length(1), body}` with the body packed
//! little-endian and at most 254 bytes. Frames are far below `PIPE_BUF`, so
//! a single `write` delivers each one atomically even with many concurrent
//! senders.

use std::os::fd::{OwnedFd, RawFd};

use crate::udp::UdpAddress;
use crate::Protocol;

/// Largest frame body. The one-byte length field caps it.
const MAX_BODY: usize = 254;

// A whole frame must fit in one atomic pipe write.
const _: () = assert!(2 + MAX_BODY <= libc::PIPE_BUF);

/// A heap buffer whose ownership is in transit through the pipe as a raw
/// pointer/length pair. The sending side leaks the allocation; the I/O
/// thread reclaims it when the frame is processed.
#[derive(Debug)]
pub(crate) struct RawBuffer {
    ptr: u64,
    len: u64,
}

impl RawBuffer {
    /// Temporarily "leak" the buffer so its address can travel through the
    /// byte pipe.
    ///
    /// Exposes provenance so that a pointer with the proper provenance can be
    /// re-acquired when the frame is consumed on the other side.
    pub(crate) fn leak(data: Box<[u8]>) -> Self {
        let len = data.len() as u64;
        let ptr = Box::into_raw(data) as *mut u8;
        RawBuffer {
            ptr: ptr.expose_provenance() as u64,
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len as usize
    }

    /// Turn the pointer/length pair back into the owned allocation.
    ///
    /// SAFETY:
    ///
    /// The pair must have been produced by `leak` and not reclaimed before.
    pub(crate) unsafe fn reclaim(self) -> Box<[u8]> {
        let ptr = std::ptr::with_exposed_provenance_mut::<u8>(self.ptr as usize);
        let slice = std::ptr::slice_from_raw_parts_mut(ptr, self.len as usize);
        Box::from_raw(slice)
    }
}

/// One request from a worker to the I/O thread. The single-letter tags are
/// the on-pipe encoding.
#[derive(Debug)]
pub(crate) enum Request {
    /// 'O': connect to host:port; the trailing hostname is resolved on the
    /// I/O thread.
    Open {
        id: i32,
        opaque: u32,
        port: u16,
        host: String,
    },
    /// 'L': install an already bound and listening fd.
    Listen { id: i32, opaque: u32, fd: RawFd },
    /// 'B': adopt an arbitrary existing fd.
    Bind { id: i32, opaque: u32, fd: RawFd },
    /// 'R': resume reading (promotes PreAccept/PreListen, transfers owner).
    Resume { id: i32, opaque: u32 },
    /// 'S': stop reading.
    Pause { id: i32, opaque: u32 },
    /// 'K': close; `shutdown` forces an immediate close.
    Close {
        id: i32,
        opaque: u32,
        shutdown: bool,
    },
    /// 'D': append to the high-priority send queue.
    SendHigh { id: i32, buffer: RawBuffer },
    /// 'P': append to the low-priority send queue.
    SendLow { id: i32, buffer: RawBuffer },
    /// 'A': send one datagram, optionally overriding the current peer.
    SendUdp {
        id: i32,
        buffer: RawBuffer,
        address: Option<UdpAddress>,
    },
    /// 'C': set the current peer of a UDP socket.
    SetUdpAddress { id: i32, address: UdpAddress },
    /// 'U': install a freshly created UDP fd.
    AddUdp {
        id: i32,
        opaque: u32,
        fd: RawFd,
        protocol: Protocol,
    },
    /// 'T': set a socket option (only TCP_NODELAY is understood).
    SetOpt { id: i32, value: i32 },
    /// 'W': writable-event handoff after a partial direct write.
    EnableWrite { id: i32 },
    /// 'X': shut the I/O thread down.
    Exit,
}

impl Request {
    /// Encode into a complete pipe frame.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(32);

        let tag = match self {
            Request::Open {
                id,
                opaque,
                port,
                host,
            } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&opaque.to_le_bytes());
                body.extend_from_slice(&port.to_le_bytes());
                body.extend_from_slice(host.as_bytes());
                b'O'
            }
            Request::Listen { id, opaque, fd } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&opaque.to_le_bytes());
                body.extend_from_slice(&fd.to_le_bytes());
                b'L'
            }
            Request::Bind { id, opaque, fd } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&opaque.to_le_bytes());
                body.extend_from_slice(&fd.to_le_bytes());
                b'B'
            }
            Request::Resume { id, opaque } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&opaque.to_le_bytes());
                b'R'
            }
            Request::Pause { id, opaque } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&opaque.to_le_bytes());
                b'S'
            }
            Request::Close {
                id,
                opaque,
                shutdown,
            } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&opaque.to_le_bytes());
                body.push(u8::from(*shutdown));
                b'K'
            }
            Request::SendHigh { id, buffer } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&buffer.ptr.to_le_bytes());
                body.extend_from_slice(&buffer.len.to_le_bytes());
                b'D'
            }
            Request::SendLow { id, buffer } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&buffer.ptr.to_le_bytes());
                body.extend_from_slice(&buffer.len.to_le_bytes());
                b'P'
            }
            Request::SendUdp {
                id,
                buffer,
                address,
            } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&buffer.ptr.to_le_bytes());
                body.extend_from_slice(&buffer.len.to_le_bytes());
                if let Some(address) = address {
                    body.extend_from_slice(address.as_bytes());
                }
                b'A'
            }
            Request::SetUdpAddress { id, address } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(address.as_bytes());
                b'C'
            }
            Request::AddUdp {
                id,
                opaque,
                fd,
                protocol,
            } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&opaque.to_le_bytes());
                body.extend_from_slice(&fd.to_le_bytes());
                body.push(*protocol as u8);
                b'U'
            }
            Request::SetOpt { id, value } => {
                body.extend_from_slice(&id.to_le_bytes());
                body.extend_from_slice(&value.to_le_bytes());
                b'T'
            }
            Request::EnableWrite { id } => {
                body.extend_from_slice(&id.to_le_bytes());
                b'W'
            }
            Request::Exit => b'X',
        };

        assert!(body.len() <= MAX_BODY);

        let mut frame = Vec::with_capacity(2 + body.len());
        frame.push(tag);
        frame.push(body.len() as u8);
        frame.append(&mut body);
        frame
    }

    /// Decode one frame body. Malformed frames indicate a corrupted pipe and
    /// are unrecoverable.
    pub(crate) fn decode(tag: u8, body: &[u8]) -> Request {
        match tag {
            b'O' => Request::Open {
                id: read_i32(body, 0),
                opaque: read_u32(body, 4),
                port: u16::from_le_bytes([body[8], body[9]]),
                host: String::from_utf8_lossy(&body[10..]).into_owned(),
            },
            b'L' => Request::Listen {
                id: read_i32(body, 0),
                opaque: read_u32(body, 4),
                fd: read_i32(body, 8),
            },
            b'B' => Request::Bind {
                id: read_i32(body, 0),
                opaque: read_u32(body, 4),
                fd: read_i32(body, 8),
            },
            b'R' => Request::Resume {
                id: read_i32(body, 0),
                opaque: read_u32(body, 4),
            },
            b'S' => Request::Pause {
                id: read_i32(body, 0),
                opaque: read_u32(body, 4),
            },
            b'K' => Request::Close {
                id: read_i32(body, 0),
                opaque: read_u32(body, 4),
                shutdown: body[8] != 0,
            },
            b'D' => Request::SendHigh {
                id: read_i32(body, 0),
                buffer: RawBuffer {
                    ptr: read_u64(body, 4),
                    len: read_u64(body, 12),
                },
            },
            b'P' => Request::SendLow {
                id: read_i32(body, 0),
                buffer: RawBuffer {
                    ptr: read_u64(body, 4),
                    len: read_u64(body, 12),
                },
            },
            b'A' => Request::SendUdp {
                id: read_i32(body, 0),
                buffer: RawBuffer {
                    ptr: read_u64(body, 4),
                    len: read_u64(body, 12),
                },
                address: UdpAddress::decode(&body[20..]).map(|(a, _)| a),
            },
            b'C' => Request::SetUdpAddress {
                id: read_i32(body, 0),
                address: UdpAddress::decode(&body[4..])
                    .map(|(a, _)| a)
                    .expect("corrupted udp address frame"),
            },
            b'U' => Request::AddUdp {
                id: read_i32(body, 0),
                opaque: read_u32(body, 4),
                fd: read_i32(body, 8),
                protocol: Protocol::from_u8(body[12]).expect("corrupted udp frame"),
            },
            b'T' => Request::SetOpt {
                id: read_i32(body, 0),
                value: read_i32(body, 4),
            },
            b'W' => Request::EnableWrite {
                id: read_i32(body, 0),
            },
            b'X' => Request::Exit,
            other => panic!("unknown control pipe tag {other:#x}"),
        }
    }
}

/// Write one frame to the pipe. Frames fit in `PIPE_BUF`, so a short write
/// can only mean the pipe is broken, which is a fatal runtime fault.
pub(crate) fn send_request(fd: &OwnedFd, request: &Request) {
    let frame = request.encode();

    loop {
        match nix::unistd::write(fd, &frame) {
            Ok(n) if n == frame.len() => return,
            Ok(n) => panic!("short write ({n} of {}) on control pipe", frame.len()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => panic!("control pipe write failed: {e}"),
        }
    }
}

fn read_i32(body: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(body[at..at + 4].try_into().unwrap())
}

fn read_u32(body: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(body[at..at + 4].try_into().unwrap())
}

fn read_u64(body: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(body[at..at + 8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(req: Request) -> Request {
        let frame = req.encode();
        assert_eq!(frame[1] as usize, frame.len() - 2);
        Request::decode(frame[0], &frame[2..])
    }

    #[test]
    fn open_carries_trailing_host() {
        let out = round_trip(Request::Open {
            id: 7,
            opaque: 0x01000003,
            port: 4000,
            host: "localhost".into(),
        });

        let Request::Open {
            id, port, host, ..
        } = out
        else {
            panic!("wrong tag");
        };
        assert_eq!((id, port, host.as_str()), (7, 4000, "localhost"));
    }

    #[test]
    fn send_buffer_survives_the_pipe() {
        let data: Box<[u8]> = vec![1u8, 2, 3, 4].into_boxed_slice();
        let out = round_trip(Request::SendHigh {
            id: 9,
            buffer: RawBuffer::leak(data),
        });

        let Request::SendHigh { id, buffer } = out else {
            panic!("wrong tag");
        };
        assert_eq!(id, 9);
        // SAFETY: the pair was produced by leak() above and reclaimed once.
        let data = unsafe { buffer.reclaim() };
        assert_eq!(&data[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn close_flag() {
        let out = round_trip(Request::Close {
            id: 3,
            opaque: 1,
            shutdown: true,
        });
        let Request::Close { shutdown, .. } = out else {
            panic!("wrong tag");
        };
        assert!(shutdown);
    }
}
