// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Non-blocking socket engine with a single I/O thread.
//!
//! One thread owns every socket and an epoll instance; all other threads
//! talk to it through a control pipe (see `pipe`). The engine knows nothing
//! about who its callers are: each socket carries an opaque 32-bit owner tag
//! that is echoed back in every event, so a higher layer can route events to
//! whatever entity opened the socket.
//!
//! The one deliberate exception to "all I/O on the I/O thread" is the direct
//! write: a caller holding data for an idle, connected socket may try the
//! `write` itself, staging any unsent remainder for the I/O thread to flush.

use log::*;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol,
    SockType, SockaddrIn, SockaddrIn6,
};

mod pipe;
mod server;
pub mod udp;

pub use server::SocketServer;
pub use udp::{UdpAddress, MAX_UDP_PACKAGE};

use pipe::{send_request, RawBuffer, Request};

/// Fixed size of the socket slot array; also the ceiling on live sockets.
pub const MAX_SOCKET: usize = 1 << 16;

/// Initial read hint for TCP sockets; doubles on a full read, halves when a
/// read comes back under a quarter of the hint.
const MIN_READ_BUFFER: usize = 64;

/// First write-queue watermark; each warning doubles the next one.
const WARNING_SIZE: usize = 1024 * 1024;

/// Life cycle of a socket slot. `Invalid` slots are free; `Reserved` is the
/// CAS-claimed intermediate that makes ID allocation race-free.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum State {
    Invalid = 0,
    Reserved,
    PreListen,
    Listen,
    Connecting,
    Connected,
    HalfCloseRead,
    HalfCloseWrite,
    PreAccept,
    Bind,
}

impl State {
    fn from_u8(v: u8) -> Option<State> {
        Some(match v {
            0 => State::Invalid,
            1 => State::Reserved,
            2 => State::PreListen,
            3 => State::Listen,
            4 => State::Connecting,
            5 => State::Connected,
            6 => State::HalfCloseRead,
            7 => State::HalfCloseWrite,
            8 => State::PreAccept,
            9 => State::Bind,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 0,
    Udp = 1,
    Udp6 = 2,
}

impl Protocol {
    pub(crate) fn from_u8(v: u8) -> Option<Protocol> {
        Some(match v {
            0 => Protocol::Tcp,
            1 => Protocol::Udp,
            2 => Protocol::Udp6,
            _ => return None,
        })
    }

    fn is_udp(self) -> bool {
        self != Protocol::Tcp
    }
}

/// Events reported by `SocketServer::poll`. `id` is the socket the event is
/// about and `opaque` is the owner tag it was opened (or resumed) with.
#[derive(Debug)]
pub enum SocketEvent {
    /// Connection established, promoted, or owner transferred. `addr` is the
    /// peer address string when one is known.
    Open { id: i32, opaque: u32, addr: String },
    /// The socket is gone. Emitted at most once per socket lifetime.
    Close { id: i32, opaque: u32 },
    /// One successful TCP read.
    Data {
        id: i32,
        opaque: u32,
        data: Box<[u8]>,
    },
    /// A listening socket produced `new_id`, left in PreAccept until the
    /// owner resumes it.
    Accept {
        id: i32,
        opaque: u32,
        new_id: i32,
        addr: String,
    },
    /// An OS-level failure; the socket has been force-closed.
    Error { id: i32, opaque: u32, err: String },
    /// One datagram together with its sender address.
    Udp {
        id: i32,
        opaque: u32,
        data: Box<[u8]>,
        address: UdpAddress,
    },
    /// The outbound queue crossed a doubling watermark (reported in KiB).
    Warning { id: i32, opaque: u32, kb: usize },
    /// The I/O thread was asked to exit.
    Exit,
}

/// Byte and timestamp counters for one socket. Times are seconds since the
/// engine started.
#[derive(Clone, Copy, Default, Debug)]
pub struct SocketStat {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub last_read: u64,
    pub last_write: u64,
    pub unsent: usize,
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Os(nix::errno::Errno),
    /// Host name did not resolve to a usable address.
    Resolve(String),
    /// All 65536 socket IDs are live.
    LimitReached,
    /// The socket ID is not (or no longer) usable.
    Closed(i32),
    /// A datagram above 65535 bytes cannot be sent.
    DatagramTooLarge(usize),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {e}"),
            Self::Os(e) => write!(f, "OS error: {e}"),
            Self::Resolve(host) => write!(f, "cannot resolve {host}"),
            Self::LimitReached => write!(f, "socket slots exhausted"),
            Self::Closed(id) => write!(f, "socket {id} is closed"),
            Self::DatagramTooLarge(sz) => write!(f, "datagram of {sz} bytes is too large"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Os(e)
    }
}

/// One pending outbound unit. TCP units may be partially written; UDP units
/// are all-or-nothing datagrams carrying their destination.
#[derive(Debug)]
struct WriteBuffer {
    data: Box<[u8]>,
    offset: usize,
    address: Option<UdpAddress>,
}

impl WriteBuffer {
    fn new(data: Box<[u8]>) -> Self {
        WriteBuffer {
            data,
            offset: 0,
            address: None,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

/// The mutable half of a socket. Both the I/O thread and the direct-write
/// fast path take this lock; every state transition happens with it held.
#[derive(Debug)]
struct SocketCore {
    id: i32,
    fd: Option<OwnedFd>,
    protocol: Protocol,
    opaque: u32,
    high: VecDeque<WriteBuffer>,
    low: VecDeque<WriteBuffer>,
    wb_size: usize,
    warn_size: usize,
    read_hint: usize,
    /// Graceful close requested; force-close once the queues drain.
    closing: bool,
    /// Close has already been reported to the owner.
    close_sent: bool,
    read_enabled: bool,
    write_enabled: bool,
    udp_peer: Option<UdpAddress>,
    bytes_read: u64,
    bytes_written: u64,
    last_read: u64,
    last_write: u64,
}

impl SocketCore {
    fn new(id: i32, fd: OwnedFd, protocol: Protocol, opaque: u32) -> Self {
        SocketCore {
            id,
            fd: Some(fd),
            protocol,
            opaque,
            high: VecDeque::new(),
            low: VecDeque::new(),
            wb_size: 0,
            warn_size: 0,
            read_hint: MIN_READ_BUFFER,
            closing: false,
            close_sent: false,
            read_enabled: false,
            write_enabled: false,
            udp_peer: None,
            bytes_read: 0,
            bytes_written: 0,
            last_read: 0,
            last_write: 0,
        }
    }

    fn queues_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }
}

struct Slot {
    /// The socket ID currently occupying this slot, 0 when free. Checked
    /// against event tokens so events for a recycled slot are dropped.
    id: AtomicI32,
    state: AtomicU8,
    core: Mutex<Option<SocketCore>>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            id: AtomicI32::new(0),
            state: AtomicU8::new(State::Invalid as u8),
            core: Mutex::new(None),
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire)).expect("slot state is a State value")
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

struct Shared {
    slots: Box<[Slot]>,
    alloc: AtomicI32,
    pipe_tx: OwnedFd,
    started: Instant,
}

impl Shared {
    fn slot(&self, id: i32) -> &Slot {
        &self.slots[(id as usize) & (MAX_SOCKET - 1)]
    }

    /// Claim a fresh socket ID by CAS-ing a free slot to Reserved. This is
    /// the only way a new ID is produced.
    fn reserve_id(&self) -> Result<i32, Error> {
        for _ in 0..MAX_SOCKET {
            let id = self.alloc.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & 0x7fff_ffff;
            if id == 0 {
                continue;
            }

            let slot = self.slot(id);
            if slot
                .state
                .compare_exchange(
                    State::Invalid as u8,
                    State::Reserved as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                slot.id.store(id, Ordering::Release);
                return Ok(id);
            }
        }

        Err(Error::LimitReached)
    }

    fn now(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// The worker-facing half of the engine: submits requests over the control
/// pipe, and performs direct writes when a socket is idle. Cheap to clone.
#[derive(Clone)]
pub struct SocketServerHandle {
    shared: Arc<Shared>,
}

/// Build the engine. The `SocketServer` half belongs to the single I/O
/// thread; the handle may be cloned freely across threads.
pub fn create() -> Result<(SocketServer, SocketServerHandle), Error> {
    let (pipe_rx, pipe_tx) = nix::unistd::pipe()?;

    let slots: Vec<Slot> = (0..MAX_SOCKET).map(|_| Slot::new()).collect();
    let shared = Arc::new(Shared {
        slots: slots.into_boxed_slice(),
        alloc: AtomicI32::new(0),
        pipe_tx,
        started: Instant::now(),
    });

    let server = SocketServer::new(shared.clone(), pipe_rx)?;
    Ok((server, SocketServerHandle { shared }))
}

impl SocketServerHandle {
    /// Start a non-blocking connect to `host:port`. Resolution and the
    /// `connect` itself happen on the I/O thread; the outcome arrives as an
    /// `Open` or `Error` event.
    pub fn connect(&self, opaque: u32, host: &str, port: u16) -> Result<i32, Error> {
        let id = self.shared.reserve_id()?;
        send_request(
            &self.shared.pipe_tx,
            &Request::Open {
                id,
                opaque,
                port,
                host: host.to_string(),
            },
        );
        Ok(id)
    }

    /// Bind and listen on `host:port`, handing the fd to the I/O thread in
    /// PreListen state. Returns the ID and the bound address (which carries
    /// the real port when 0 was requested). The caller must `start` the
    /// returned ID before any connection is accepted.
    pub fn listen(
        &self,
        opaque: u32,
        host: &str,
        port: u16,
        backlog: i32,
    ) -> Result<(i32, SocketAddr), Error> {
        let fd = new_tcp_listener(host, port, backlog)?;
        let bound = local_addr(&fd)?;
        let id = self.shared.reserve_id()?;
        send_request(
            &self.shared.pipe_tx,
            &Request::Listen {
                id,
                opaque,
                fd: fd.into_raw_fd(),
            },
        );
        Ok((id, bound))
    }

    /// Adopt an existing fd (for example stdin or a socketpair end) as a
    /// Bind-state socket delivering `Data` events.
    pub fn bind(&self, opaque: u32, fd: RawFd) -> Result<i32, Error> {
        let id = self.shared.reserve_id()?;
        send_request(&self.shared.pipe_tx, &Request::Bind { id, opaque, fd });
        Ok(id)
    }

    /// Resume reading. Promotes PreAccept/PreListen sockets to live ones and
    /// transfers ownership to `opaque`.
    pub fn start(&self, opaque: u32, id: i32) {
        send_request(&self.shared.pipe_tx, &Request::Resume { id, opaque });
    }

    /// Stop delivering read events until the next `start`.
    pub fn pause(&self, opaque: u32, id: i32) {
        send_request(&self.shared.pipe_tx, &Request::Pause { id, opaque });
    }

    /// Graceful close: pending writes drain before the fd goes away.
    pub fn close(&self, opaque: u32, id: i32) {
        send_request(
            &self.shared.pipe_tx,
            &Request::Close {
                id,
                opaque,
                shutdown: false,
            },
        );
    }

    /// Immediate close, discarding anything still queued.
    pub fn shutdown(&self, opaque: u32, id: i32) {
        send_request(
            &self.shared.pipe_tx,
            &Request::Close {
                id,
                opaque,
                shutdown: true,
            },
        );
    }

    pub fn nodelay(&self, id: i32) {
        send_request(&self.shared.pipe_tx, &Request::SetOpt { id, value: 1 });
    }

    /// Ask the I/O thread to exit; `poll` returns `Exit` once.
    pub fn exit(&self) {
        send_request(&self.shared.pipe_tx, &Request::Exit);
    }

    /// Queue `data` on the high-priority band. If the socket is connected
    /// and completely idle this writes inline from the calling thread and
    /// only involves the I/O thread for an unsent remainder.
    pub fn send(&self, id: i32, data: Vec<u8>) -> Result<(), Error> {
        self.send_with_priority(id, data, true)
    }

    /// Queue `data` on the low-priority band. Low units are sent one per
    /// writable cycle once the high band is empty.
    pub fn send_lowpriority(&self, id: i32, data: Vec<u8>) -> Result<(), Error> {
        self.send_with_priority(id, data, false)
    }

    fn send_with_priority(&self, id: i32, data: Vec<u8>, high: bool) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        let slot = self.shared.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return Err(Error::Closed(id));
        }
        match slot.state() {
            State::Invalid | State::Reserved | State::HalfCloseWrite => {
                return Err(Error::Closed(id));
            }
            _ => {}
        }

        let data = if high {
            match self.try_direct_write(id, data)? {
                None => return Ok(()),
                Some(data) => data,
            }
        } else {
            data
        };

        let buffer = RawBuffer::leak(data.into_boxed_slice());
        let request = if high {
            Request::SendHigh { id, buffer }
        } else {
            Request::SendLow { id, buffer }
        };
        send_request(&self.shared.pipe_tx, &request);
        Ok(())
    }

    /// The direct-write fast path. Returns `None` when the data was fully
    /// handled here (written, or staged with a 'W' handoff); returns the
    /// data back when the socket was busy and the pipe must be used.
    ///
    /// The handshake: trylock the socket, re-check Connected with empty
    /// queues under the lock, write, stage any remainder at the head of the
    /// high band still under the lock, then notify the I/O thread. State
    /// transitions only ever happen with this lock held, so the I/O thread
    /// can never observe a half-staged remainder.
    fn try_direct_write(&self, id: i32, data: Vec<u8>) -> Result<Option<Vec<u8>>, Error> {
        let slot = self.shared.slot(id);

        let Ok(mut guard) = slot.core.try_lock() else {
            return Ok(Some(data));
        };
        let Some(core) = guard.as_mut() else {
            return Ok(Some(data));
        };

        if core.id != id
            || slot.state() != State::Connected
            || !core.queues_empty()
            || core.closing
        {
            return Ok(Some(data));
        }

        let written = match core.protocol {
            Protocol::Tcp => {
                let fd = core.fd.as_ref().expect("connected socket keeps its fd");
                match nix::unistd::write(fd, &data) {
                    Ok(n) => n,
                    Err(nix::errno::Errno::EINTR) | Err(nix::errno::Errno::EAGAIN) => 0,
                    // Let the I/O thread discover the failure and report it:
                    Err(_) => return Ok(Some(data)),
                }
            }
            Protocol::Udp | Protocol::Udp6 => {
                let Some(peer) = core.udp_peer else {
                    return Ok(Some(data));
                };
                let fd = core.fd.as_ref().expect("connected socket keeps its fd");
                match send_datagram(fd, &data, &peer) {
                    Ok(()) => data.len(),
                    Err(nix::errno::Errno::EINTR) | Err(nix::errno::Errno::EAGAIN) => 0,
                    Err(e) => {
                        // Datagrams are all-or-nothing; drop it like any
                        // other transient UDP loss.
                        warn!("udp send on socket {id} failed: {e}");
                        return Ok(None);
                    }
                }
            }
        };

        core.bytes_written += written as u64;
        core.last_write = self.shared.now();

        if written == data.len() {
            return Ok(None);
        }

        let peer = core.udp_peer.filter(|_| core.protocol.is_udp());
        let mut staged = WriteBuffer::new(data.into_boxed_slice());
        staged.offset = written;
        staged.address = peer;
        core.wb_size += staged.remaining();
        core.high.push_front(staged);
        drop(guard);

        send_request(&self.shared.pipe_tx, &Request::EnableWrite { id });
        Ok(None)
    }

    /// Create a UDP socket, bound to `host:port` when `host` is non-empty.
    /// UDP sockets are live immediately; there is no `start` step.
    pub fn udp(&self, opaque: u32, host: &str, port: u16) -> Result<(i32, SocketAddr), Error> {
        let (fd, protocol) = new_udp_socket(host, port)?;
        let bound = local_addr(&fd)?;
        let id = self.shared.reserve_id()?;
        send_request(
            &self.shared.pipe_tx,
            &Request::AddUdp {
                id,
                opaque,
                fd: fd.into_raw_fd(),
                protocol,
            },
        );
        Ok((id, bound))
    }

    /// Set the current peer for `udp_send` calls that do not name one.
    pub fn udp_connect(&self, id: i32, host: &str, port: u16) -> Result<(), Error> {
        let addr = resolve(host, port)?;
        send_request(
            &self.shared.pipe_tx,
            &Request::SetUdpAddress {
                id,
                address: UdpAddress::from(addr),
            },
        );
        Ok(())
    }

    /// Send one datagram, to `address` when given, else to the current peer.
    pub fn udp_send(
        &self,
        id: i32,
        address: Option<&UdpAddress>,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        if data.len() > MAX_UDP_PACKAGE {
            return Err(Error::DatagramTooLarge(data.len()));
        }

        let slot = self.shared.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return Err(Error::Closed(id));
        }

        if address.is_none() {
            // No per-call override: the current-peer fast path is the same
            // as a plain high-priority send.
            return self.send_with_priority(id, data, true);
        }

        send_request(
            &self.shared.pipe_tx,
            &Request::SendUdp {
                id,
                buffer: RawBuffer::leak(data.into_boxed_slice()),
                address: address.copied(),
            },
        );
        Ok(())
    }

    /// Counters for a live socket.
    pub fn stat(&self, id: i32) -> Option<SocketStat> {
        let slot = self.shared.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return None;
        }

        let guard = slot.core.lock().expect("socket lock poisoned");
        let core = guard.as_ref()?;
        Some(SocketStat {
            bytes_read: core.bytes_read,
            bytes_written: core.bytes_written,
            last_read: core.last_read,
            last_write: core.last_write,
            unsent: core.wb_size,
        })
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    use std::net::ToSocketAddrs;

    let host = if host.is_empty() { "0.0.0.0" } else { host };
    (host, port)
        .to_socket_addrs()
        .map_err(Error::Io)?
        .next()
        .ok_or_else(|| Error::Resolve(host.to_string()))
}

fn new_tcp_listener(host: &str, port: u16, backlog: i32) -> Result<OwnedFd, Error> {
    let addr = resolve(host, port)?;
    let fd = new_socket(&addr, SockType::Stream, SockProtocol::Tcp)?;

    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    bind_addr(&fd, &addr)?;
    listen(&fd, Backlog::new(backlog).unwrap_or(Backlog::MAXCONN))?;

    Ok(fd)
}

fn new_udp_socket(host: &str, port: u16) -> Result<(OwnedFd, Protocol), Error> {
    if host.is_empty() && port == 0 {
        // Unbound v4 socket for pure senders.
        let fd = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::Udp,
        )?;
        return Ok((fd, Protocol::Udp));
    }

    let addr = resolve(host, port)?;
    let fd = new_socket(&addr, SockType::Datagram, SockProtocol::Udp)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    bind_addr(&fd, &addr)?;

    let protocol = if addr.is_ipv6() {
        Protocol::Udp6
    } else {
        Protocol::Udp
    };
    Ok((fd, protocol))
}

fn new_socket(addr: &SocketAddr, ty: SockType, proto: SockProtocol) -> Result<OwnedFd, Error> {
    let family = if addr.is_ipv6() {
        AddressFamily::Inet6
    } else {
        AddressFamily::Inet
    };

    Ok(socket(
        family,
        ty,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        proto,
    )?)
}

fn bind_addr(fd: &OwnedFd, addr: &SocketAddr) -> Result<(), Error> {
    match addr {
        SocketAddr::V4(v4) => bind(fd.as_raw_fd(), &SockaddrIn::from(*v4))?,
        SocketAddr::V6(v6) => bind(fd.as_raw_fd(), &SockaddrIn6::from(*v6))?,
    }
    Ok(())
}

fn local_addr(fd: &OwnedFd) -> Result<SocketAddr, Error> {
    use nix::sys::socket::{getsockname, SockaddrStorage};

    let addr = getsockname::<SockaddrStorage>(fd.as_raw_fd())?;
    sockaddr_to_std(&addr).ok_or_else(|| Error::Resolve("bound address".to_string()))
}

pub(crate) fn sockaddr_to_std(addr: &nix::sys::socket::SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = addr.as_sockaddr_in() {
        return Some(SocketAddr::from((sin.ip(), sin.port())));
    }
    if let Some(sin6) = addr.as_sockaddr_in6() {
        return Some(SocketAddr::from((sin6.ip(), sin6.port())));
    }
    None
}

/// Send one whole datagram or report why not.
fn send_datagram(
    fd: &OwnedFd,
    data: &[u8],
    peer: &UdpAddress,
) -> Result<(), nix::errno::Errno> {
    use nix::sys::socket::{sendto, MsgFlags};

    let addr = peer.to_socket_addr().ok_or(nix::errno::Errno::EINVAL)?;
    let sent = match addr {
        SocketAddr::V4(v4) => sendto(
            fd.as_raw_fd(),
            data,
            &SockaddrIn::from(v4),
            MsgFlags::empty(),
        )?,
        SocketAddr::V6(v6) => sendto(
            fd.as_raw_fd(),
            data,
            &SockaddrIn6::from(v6),
            MsgFlags::empty(),
        )?,
    };

    // A datagram either goes out whole or not at all.
    debug_assert_eq!(sent, data.len());
    Ok(())
}
