// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The I/O-thread half of the engine: the epoll loop, control-pipe command
//! execution, and the per-socket state machine.

use log::*;

use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::socket::{
    accept4, getpeername, getsockopt, setsockopt, sockopt, Shutdown, SockFlag, SockaddrStorage,
};

use crate::pipe::{Request, RawBuffer};
use crate::udp::{UdpAddress, MAX_UDP_PACKAGE};
use crate::{
    resolve, send_datagram, sockaddr_to_std, Error, Protocol, Shared, Slot, SocketCore,
    SocketEvent, State, WriteBuffer, MIN_READ_BUFFER, WARNING_SIZE,
};

const MAX_EVENT: usize = 64;

/// Epoll token for the control pipe's read end.
const PIPE_TOKEN: u64 = u64::MAX;

/// A readiness report for one socket, unpacked from epoll so that a
/// combined read+write event can be consumed in two steps.
struct Readiness {
    id: i32,
    read: bool,
    write: bool,
    error: bool,
    eof: bool,
}

/// Owned by exactly one thread, which calls `poll` in a loop until it
/// returns `SocketEvent::Exit`.
pub struct SocketServer {
    shared: Arc<Shared>,
    epoll: Epoll,
    pipe_rx: OwnedFd,
    pending: Vec<Readiness>,
    pending_index: usize,
    check_ctrl: bool,
    /// Held open so a slot is available to drain the accept queue after
    /// EMFILE.
    reserve_fd: Option<OwnedFd>,
}

impl SocketServer {
    pub(crate) fn new(shared: Arc<Shared>, pipe_rx: OwnedFd) -> Result<Self, Error> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(
            pipe_rx.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLIN, PIPE_TOKEN),
        )?;

        Ok(SocketServer {
            shared,
            epoll,
            pipe_rx,
            pending: Vec::with_capacity(MAX_EVENT),
            pending_index: 0,
            check_ctrl: true,
            reserve_fd: open_reserve_fd(),
        })
    }

    /// Block until the engine has something to report. Control-pipe
    /// requests are executed between event batches; requests that produce
    /// no event (pause, setopt, ...) are absorbed here.
    pub fn poll(&mut self) -> SocketEvent {
        loop {
            if self.check_ctrl {
                if self.has_cmd() {
                    if let Some(event) = self.ctrl_cmd() {
                        return event;
                    }
                    continue;
                }
                self.check_ctrl = false;
            }

            if self.pending_index == self.pending.len() {
                self.wait_for_events();
                continue;
            }

            let readiness = &mut self.pending[self.pending_index];
            let id = readiness.id;

            let slot = self.shared.slot(id);
            if slot.id.load(Ordering::Acquire) != id || slot.state() == State::Invalid {
                // The socket closed between the wait and now.
                self.pending_index += 1;
                continue;
            }

            match slot.state() {
                State::Connecting => {
                    self.pending_index += 1;
                    if let Some(event) = self.report_connect(id) {
                        return event;
                    }
                }
                State::Listen => {
                    let read = readiness.read;
                    let eof = readiness.eof && !readiness.error;
                    let failed = readiness.error || readiness.eof;
                    self.pending_index += 1;
                    if read {
                        if let Some(event) = self.report_accept(id) {
                            return event;
                        }
                    } else if failed {
                        if let Some(event) = self.report_error(id, eof) {
                            return event;
                        }
                    }
                }
                _ => {
                    if readiness.read {
                        // Leave the event in place when a write is also
                        // pending; it is consumed on the next pass.
                        if readiness.write {
                            readiness.read = false;
                        } else {
                            self.pending_index += 1;
                        }
                        if let Some(event) = self.forward_message(id) {
                            return event;
                        }
                    } else if readiness.write {
                        self.pending_index += 1;
                        if let Some(event) = self.send_buffer(id) {
                            return event;
                        }
                    } else if readiness.error || readiness.eof {
                        let eof = readiness.eof && !readiness.error;
                        self.pending_index += 1;
                        if let Some(event) = self.report_error(id, eof) {
                            return event;
                        }
                    } else {
                        self.pending_index += 1;
                    }
                }
            }
        }
    }

    fn wait_for_events(&mut self) {
        let mut raw = vec![EpollEvent::empty(); MAX_EVENT];

        let n = match self.epoll.wait(&mut raw, EpollTimeout::NONE) {
            Ok(n) => n,
            Err(Errno::EINTR) => return,
            Err(e) => {
                error!("epoll wait failed: {e}");
                return;
            }
        };

        self.pending.clear();
        self.pending_index = 0;

        for event in &raw[..n] {
            if event.data() == PIPE_TOKEN {
                self.check_ctrl = true;
                continue;
            }

            let flags = event.events();
            self.pending.push(Readiness {
                id: event.data() as i32,
                read: flags.contains(EpollFlags::EPOLLIN),
                write: flags.contains(EpollFlags::EPOLLOUT),
                error: flags.contains(EpollFlags::EPOLLERR),
                eof: flags.contains(EpollFlags::EPOLLHUP),
            });
        }
    }

    fn has_cmd(&self) -> bool {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

        let mut fds = [PollFd::new(self.pipe_rx.as_fd(), PollFlags::POLLIN)];
        matches!(poll(&mut fds, PollTimeout::ZERO), Ok(n) if n > 0)
    }

    /// Read and execute one control frame.
    fn ctrl_cmd(&mut self) -> Option<SocketEvent> {
        let mut header = [0u8; 2];
        self.read_pipe(&mut header);

        let mut body = vec![0u8; header[1] as usize];
        self.read_pipe(&mut body);

        match Request::decode(header[0], &body) {
            Request::Open {
                id,
                opaque,
                port,
                host,
            } => self.open_socket(id, opaque, &host, port),
            Request::Listen { id, opaque, fd } => self.listen_socket(id, opaque, fd),
            Request::Bind { id, opaque, fd } => self.bind_socket(id, opaque, fd),
            Request::Resume { id, opaque } => self.resume_socket(id, opaque),
            Request::Pause { id, opaque } => {
                self.pause_socket(id, opaque);
                None
            }
            Request::Close {
                id,
                opaque,
                shutdown,
            } => self.close_socket(id, opaque, shutdown),
            Request::SendHigh { id, buffer } => self.append_send(id, buffer, true, None),
            Request::SendLow { id, buffer } => self.append_send(id, buffer, false, None),
            Request::SendUdp {
                id,
                buffer,
                address,
            } => self.append_send(id, buffer, true, address),
            Request::SetUdpAddress { id, address } => self.set_udp_address(id, address),
            Request::AddUdp {
                id,
                opaque,
                fd,
                protocol,
            } => self.add_udp(id, opaque, fd, protocol),
            Request::SetOpt { id, value } => {
                self.setopt(id, value);
                None
            }
            Request::EnableWrite { id } => self.enable_write_request(id),
            Request::Exit => Some(SocketEvent::Exit),
        }
    }

    fn read_pipe(&self, buf: &mut [u8]) {
        let mut offset = 0;
        while offset < buf.len() {
            match nix::unistd::read(&self.pipe_rx, &mut buf[offset..]) {
                Ok(0) => panic!("control pipe closed while the I/O thread is live"),
                Ok(n) => offset += n,
                Err(Errno::EINTR) => continue,
                Err(e) => panic!("control pipe read failed: {e}"),
            }
        }
    }

    // -- command execution ---------------------------------------------

    fn open_socket(&mut self, id: i32, opaque: u32, host: &str, port: u16) -> Option<SocketEvent> {
        let result = self.start_connect(id, opaque, host, port);
        match result {
            Ok(event) => event,
            Err(e) => {
                self.free_slot(id);
                Some(SocketEvent::Error {
                    id,
                    opaque,
                    err: e.to_string(),
                })
            }
        }
    }

    fn start_connect(
        &mut self,
        id: i32,
        opaque: u32,
        host: &str,
        port: u16,
    ) -> Result<Option<SocketEvent>, Error> {
        let addr = resolve(host, port)?;
        let fd = crate::new_socket(&addr, nix::sys::socket::SockType::Stream,
            nix::sys::socket::SockProtocol::Tcp)?;

        if let Err(e) = setsockopt(&fd, sockopt::KeepAlive, &true) {
            debug!("keepalive on socket {id}: {e}");
        }

        let connected = match connect_addr(&fd, &addr) {
            Ok(()) => true,
            Err(Errno::EINPROGRESS) => false,
            Err(e) => return Err(Error::Os(e)),
        };

        let slot = self.shared.slot(id);
        let mut core = SocketCore::new(id, fd, Protocol::Tcp, opaque);

        if connected {
            core.read_enabled = true;
            self.register(&core)?;
            slot.set_state(State::Connected);
            let addr = peer_string(core.fd.as_ref().unwrap().as_raw_fd())
                .unwrap_or_else(|| addr.to_string());
            *slot.core.lock().expect("socket lock poisoned") = Some(core);
            Ok(Some(SocketEvent::Open { id, opaque, addr }))
        } else {
            core.write_enabled = true;
            self.register(&core)?;
            slot.set_state(State::Connecting);
            *slot.core.lock().expect("socket lock poisoned") = Some(core);
            Ok(None)
        }
    }

    fn listen_socket(&mut self, id: i32, opaque: u32, fd: RawFd) -> Option<SocketEvent> {
        // SAFETY: ownership of the fd was passed through the frame by
        // `SocketServerHandle::listen`, which forgot it with into_raw_fd().
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let slot = self.shared.slot(id);
        let core = SocketCore::new(id, fd, Protocol::Tcp, opaque);
        if let Err(e) = self.register(&core) {
            self.free_slot(id);
            return Some(SocketEvent::Error {
                id,
                opaque,
                err: e.to_string(),
            });
        }

        // Not accepting yet: the owner must resume the socket first.
        slot.set_state(State::PreListen);
        *slot.core.lock().expect("socket lock poisoned") = Some(core);
        None
    }

    fn bind_socket(&mut self, id: i32, opaque: u32, fd: RawFd) -> Option<SocketEvent> {
        // SAFETY: the caller of `SocketServerHandle::bind` hands the fd over.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if let Err(e) = fcntl(&fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
            self.free_slot(id);
            return Some(SocketEvent::Error {
                id,
                opaque,
                err: e.to_string(),
            });
        }

        let slot = self.shared.slot(id);
        let mut core = SocketCore::new(id, fd, Protocol::Tcp, opaque);
        core.read_enabled = true;
        if let Err(e) = self.register(&core) {
            self.free_slot(id);
            return Some(SocketEvent::Error {
                id,
                opaque,
                err: e.to_string(),
            });
        }

        slot.set_state(State::Bind);
        *slot.core.lock().expect("socket lock poisoned") = Some(core);
        Some(SocketEvent::Open {
            id,
            opaque,
            addr: "binding".to_string(),
        })
    }

    fn resume_socket(&mut self, id: i32, opaque: u32) -> Option<SocketEvent> {
        let slot = self.shared.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return Some(SocketEvent::Error {
                id,
                opaque,
                err: "invalid socket".to_string(),
            });
        }

        let mut guard = slot.core.lock().expect("socket lock poisoned");
        let Some(core) = guard.as_mut() else {
            return Some(SocketEvent::Error {
                id,
                opaque,
                err: "invalid socket".to_string(),
            });
        };

        match slot.state() {
            State::PreAccept | State::PreListen => {
                let next = if slot.state() == State::PreAccept {
                    State::Connected
                } else {
                    State::Listen
                };
                core.opaque = opaque;
                self.enable_read(core, true);
                slot.set_state(next);
                Some(SocketEvent::Open {
                    id,
                    opaque,
                    addr: "start".to_string(),
                })
            }
            State::Connected | State::Listen | State::Bind => {
                // Already live: this is an ownership transfer.
                core.opaque = opaque;
                Some(SocketEvent::Open {
                    id,
                    opaque,
                    addr: "transfer".to_string(),
                })
            }
            _ => Some(SocketEvent::Error {
                id,
                opaque,
                err: "socket closed".to_string(),
            }),
        }
    }

    fn pause_socket(&mut self, id: i32, _opaque: u32) {
        let slot = self.shared.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return;
        }

        let mut guard = slot.core.lock().expect("socket lock poisoned");
        if let Some(core) = guard.as_mut() {
            self.enable_read(core, false);
        }
    }

    fn close_socket(&mut self, id: i32, opaque: u32, force: bool) -> Option<SocketEvent> {
        let slot = self.shared.slot(id);
        let mut guard = slot.core.lock().expect("socket lock poisoned");

        if slot.id.load(Ordering::Acquire) != id || guard.is_none() {
            // Already gone; report the close so the owner's state machine
            // can finish.
            return Some(SocketEvent::Close { id, opaque });
        }

        let core = guard.as_mut().unwrap();
        let first_report = !core.close_sent;
        core.close_sent = true;

        if force || core.queues_empty() {
            self.force_close(slot, &mut guard);
            return first_report.then_some(SocketEvent::Close { id, opaque });
        }

        // Pending data: keep the write half open, shut the read half, and
        // linger until the queues drain.
        core.closing = true;
        if let Some(fd) = core.fd.as_ref() {
            let _ = nix::sys::socket::shutdown(fd.as_raw_fd(), Shutdown::Read);
        }
        self.enable_read(core, false);
        self.enable_write(core, true);
        slot.set_state(State::HalfCloseRead);

        first_report.then_some(SocketEvent::Close { id, opaque })
    }

    fn append_send(
        &mut self,
        id: i32,
        buffer: RawBuffer,
        high: bool,
        address: Option<UdpAddress>,
    ) -> Option<SocketEvent> {
        // SAFETY: produced by leak() on the sending side, reclaimed exactly
        // once here.
        let data = unsafe { buffer.reclaim() };

        let slot = self.shared.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            trace!("dropping {} bytes for dead socket {id}", data.len());
            return None;
        }

        let mut guard = slot.core.lock().expect("socket lock poisoned");
        let Some(core) = guard.as_mut() else {
            return None;
        };

        match slot.state() {
            State::Invalid | State::Reserved | State::HalfCloseWrite | State::PreAccept => {
                return None;
            }
            State::Listen | State::PreListen => {
                error!("write to listening socket {id}");
                return None;
            }
            _ if core.closing => return None,
            _ => {}
        }

        let mut unit = WriteBuffer::new(data);
        unit.address = address;
        core.wb_size += unit.remaining();
        if high {
            core.high.push_back(unit);
        } else {
            core.low.push_back(unit);
        }
        self.enable_write(core, true);

        self.check_warning(core)
    }

    fn set_udp_address(&mut self, id: i32, address: UdpAddress) -> Option<SocketEvent> {
        let slot = self.shared.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return None;
        }

        let mut guard = slot.core.lock().expect("socket lock poisoned");
        let core = guard.as_mut()?;

        let matches = match core.protocol {
            Protocol::Udp => !address.is_v6(),
            Protocol::Udp6 => address.is_v6(),
            Protocol::Tcp => false,
        };
        if !matches {
            return Some(SocketEvent::Error {
                id,
                opaque: core.opaque,
                err: "protocol mismatch".to_string(),
            });
        }

        core.udp_peer = Some(address);
        None
    }

    fn add_udp(&mut self, id: i32, opaque: u32, fd: RawFd, protocol: Protocol) -> Option<SocketEvent> {
        // SAFETY: the fd travelled through the frame from
        // `SocketServerHandle::udp`, which owns no copy of it anymore.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let slot = self.shared.slot(id);
        let mut core = SocketCore::new(id, fd, protocol, opaque);
        core.read_enabled = true;
        if let Err(e) = self.register(&core) {
            self.free_slot(id);
            return Some(SocketEvent::Error {
                id,
                opaque,
                err: e.to_string(),
            });
        }

        // Datagram sockets are live as soon as they exist.
        slot.set_state(State::Connected);
        *slot.core.lock().expect("socket lock poisoned") = Some(core);
        None
    }

    fn setopt(&mut self, id: i32, value: i32) {
        let slot = self.shared.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return;
        }

        let guard = slot.core.lock().expect("socket lock poisoned");
        if let Some(core) = guard.as_ref() {
            if let Some(fd) = core.fd.as_ref() {
                if let Err(e) = setsockopt(fd, sockopt::TcpNoDelay, &(value != 0)) {
                    debug!("nodelay on socket {id}: {e}");
                }
            }
        }
    }

    /// Writable-interest handoff after a worker staged a partial direct
    /// write. Also the point where the staged bytes are weighed against the
    /// warning watermark.
    fn enable_write_request(&mut self, id: i32) -> Option<SocketEvent> {
        let slot = self.shared.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return None;
        }

        let mut guard = slot.core.lock().expect("socket lock poisoned");
        let core = guard.as_mut()?;
        if core.queues_empty() {
            return None;
        }

        self.enable_write(core, true);
        self.check_warning(core)
    }

    // -- readiness handling --------------------------------------------

    fn report_connect(&mut self, id: i32) -> Option<SocketEvent> {
        let slot = self.shared.slot(id);
        let mut guard = slot.core.lock().expect("socket lock poisoned");
        let core = guard.as_mut()?;
        let opaque = core.opaque;

        let error = match getsockopt(core.fd.as_ref().unwrap(), sockopt::SocketError) {
            Ok(0) => None,
            Ok(raw) => Some(Errno::from_raw(raw).to_string()),
            Err(e) => Some(e.to_string()),
        };

        if let Some(err) = error {
            self.force_close(slot, &mut guard);
            return Some(SocketEvent::Error { id, opaque, err });
        }

        let addr = peer_string(core.fd.as_ref().unwrap().as_raw_fd()).unwrap_or_default();
        if core.queues_empty() {
            self.enable_write(core, false);
        }
        self.enable_read(core, true);
        slot.set_state(State::Connected);

        Some(SocketEvent::Open { id, opaque, addr })
    }

    fn report_accept(&mut self, id: i32) -> Option<SocketEvent> {
        let slot = self.shared.slot(id);
        let (listen_fd, opaque) = {
            let guard = slot.core.lock().expect("socket lock poisoned");
            let core = guard.as_ref()?;
            (core.fd.as_ref()?.as_raw_fd(), core.opaque)
        };

        let client = match accept4(listen_fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => {
                // SAFETY: accept4 returned a fresh fd owned by no one else.
                unsafe { OwnedFd::from_raw_fd(fd) }
            }
            Err(Errno::EMFILE) | Err(Errno::ENFILE) => {
                error!("accept on socket {id}: out of file descriptors");
                self.drain_one_connection(listen_fd);
                return None;
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) | Err(Errno::ECONNABORTED) => return None,
            Err(e) => {
                error!("accept on socket {id}: {e}");
                return None;
            }
        };

        let Ok(new_id) = self.shared.reserve_id() else {
            warn!("socket slots exhausted, dropping accepted connection");
            return None;
        };

        if let Err(e) = setsockopt(&client, sockopt::KeepAlive, &true) {
            debug!("keepalive on accepted socket {new_id}: {e}");
        }

        let addr = peer_string(client.as_raw_fd()).unwrap_or_default();

        let new_slot = self.shared.slot(new_id);
        let core = SocketCore::new(new_id, client, Protocol::Tcp, opaque);
        if let Err(e) = self.register(&core) {
            error!("registering accepted socket {new_id}: {e}");
            self.free_slot(new_id);
            return None;
        }
        new_slot.set_state(State::PreAccept);
        *new_slot.core.lock().expect("socket lock poisoned") = Some(core);

        Some(SocketEvent::Accept {
            id,
            opaque,
            new_id,
            addr,
        })
    }

    /// After EMFILE: close the reserve fd, use the freed slot to accept and
    /// immediately drop one pending connection, then take the reserve back.
    fn drain_one_connection(&mut self, listen_fd: RawFd) {
        self.reserve_fd = None;
        if let Ok(fd) = accept4(listen_fd, SockFlag::empty()) {
            let _ = nix::unistd::close(fd);
        }
        self.reserve_fd = open_reserve_fd();
    }

    fn forward_message(&mut self, id: i32) -> Option<SocketEvent> {
        let slot = self.shared.slot(id);
        if slot.state() == State::HalfCloseRead {
            return None;
        }

        let protocol = {
            let guard = slot.core.lock().expect("socket lock poisoned");
            guard.as_ref()?.protocol
        };

        match protocol {
            Protocol::Tcp => self.forward_message_tcp(id),
            Protocol::Udp | Protocol::Udp6 => self.forward_message_udp(id),
        }
    }

    fn forward_message_tcp(&mut self, id: i32) -> Option<SocketEvent> {
        let slot = self.shared.slot(id);
        let mut guard = slot.core.lock().expect("socket lock poisoned");
        let core = guard.as_mut()?;
        let opaque = core.opaque;

        let hint = core.read_hint;
        let mut buf = vec![0u8; hint];

        let n = match nix::unistd::read(core.fd.as_ref()?, &mut buf) {
            Ok(n) => n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return None,
            Err(e) => {
                self.force_close(slot, &mut guard);
                return Some(SocketEvent::Error {
                    id,
                    opaque,
                    err: e.to_string(),
                });
            }
        };

        if n == 0 {
            // EOF from the peer.
            let first_report = !core.close_sent;
            core.close_sent = true;

            if core.closing && core.queues_empty() {
                self.force_close(slot, &mut guard);
            } else {
                self.enable_read(core, false);
                slot.set_state(State::HalfCloseRead);
            }
            return first_report.then_some(SocketEvent::Close { id, opaque });
        }

        if n == hint {
            core.read_hint *= 2;
        } else if hint > MIN_READ_BUFFER && n * 4 < hint {
            core.read_hint /= 2;
        }

        core.bytes_read += n as u64;
        core.last_read = self.shared.now();

        buf.truncate(n);
        Some(SocketEvent::Data {
            id,
            opaque,
            data: buf.into_boxed_slice(),
        })
    }

    fn forward_message_udp(&mut self, id: i32) -> Option<SocketEvent> {
        use nix::sys::socket::recvfrom;

        let slot = self.shared.slot(id);
        let mut guard = slot.core.lock().expect("socket lock poisoned");
        let core = guard.as_mut()?;
        let opaque = core.opaque;

        let mut buf = vec![0u8; MAX_UDP_PACKAGE];
        let fd = core.fd.as_ref()?.as_raw_fd();

        match recvfrom::<SockaddrStorage>(fd, &mut buf) {
            Ok((n, Some(from))) => {
                let Some(addr) = sockaddr_to_std(&from) else {
                    return None;
                };

                core.bytes_read += n as u64;
                core.last_read = self.shared.now();

                buf.truncate(n);
                Some(SocketEvent::Udp {
                    id,
                    opaque,
                    data: buf.into_boxed_slice(),
                    address: UdpAddress::from(addr),
                })
            }
            Ok((_, None)) => None,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => None,
            Err(e) => {
                self.force_close(slot, &mut guard);
                Some(SocketEvent::Error {
                    id,
                    opaque,
                    err: e.to_string(),
                })
            }
        }
    }

    /// Flush on writable readiness: the staged/high band until it would
    /// block, then one unit from the low band. A partially sent low unit is
    /// promoted into the high band so it cannot be preempted mid-buffer.
    fn send_buffer(&mut self, id: i32) -> Option<SocketEvent> {
        let slot = self.shared.slot(id);
        let mut guard = slot.core.lock().expect("socket lock poisoned");
        let core = guard.as_mut()?;
        let opaque = core.opaque;
        let now = self.shared.now();

        let fallback_peer = if core.protocol.is_udp() {
            core.udp_peer
        } else {
            None
        };

        while let Some(front) = core.high.front_mut() {
            match write_unit(core.fd.as_ref()?, front, fallback_peer) {
                UnitProgress::Done(n) => {
                    core.wb_size -= n;
                    core.bytes_written += n as u64;
                    core.last_write = now;
                    core.high.pop_front();
                }
                UnitProgress::Partial(n) => {
                    core.wb_size -= n;
                    core.bytes_written += n as u64;
                    core.last_write = now;
                    return None;
                }
                UnitProgress::WouldBlock => return None,
                UnitProgress::DropUnit(e) => {
                    warn!("dropping datagram on socket {id}: {e}");
                    core.wb_size -= front.remaining();
                    core.high.pop_front();
                }
                UnitProgress::Fatal(e) => {
                    self.force_close(slot, &mut guard);
                    return Some(SocketEvent::Error {
                        id,
                        opaque,
                        err: e.to_string(),
                    });
                }
            }
        }

        if let Some(mut unit) = core.low.pop_front() {
            match write_unit(core.fd.as_ref()?, &mut unit, fallback_peer) {
                UnitProgress::Done(n) => {
                    core.wb_size -= n;
                    core.bytes_written += n as u64;
                    core.last_write = now;
                }
                UnitProgress::Partial(n) => {
                    core.wb_size -= n;
                    core.bytes_written += n as u64;
                    core.last_write = now;
                    // Head-of-line rule: the remainder moves up so the next
                    // writable cycle finishes this unit first.
                    core.high.push_back(unit);
                    return None;
                }
                UnitProgress::WouldBlock => {
                    core.low.push_front(unit);
                    return None;
                }
                UnitProgress::DropUnit(e) => {
                    warn!("dropping datagram on socket {id}: {e}");
                    core.wb_size -= unit.remaining();
                }
                UnitProgress::Fatal(e) => {
                    self.force_close(slot, &mut guard);
                    return Some(SocketEvent::Error {
                        id,
                        opaque,
                        err: e.to_string(),
                    });
                }
            }
        }

        if core.queues_empty() {
            self.enable_write(core, false);

            if core.closing || slot.state() == State::HalfCloseRead {
                // The close was reported when it was requested; finishing
                // the drain completes it silently.
                self.force_close(slot, &mut guard);
            }
        }

        None
    }

    fn report_error(&mut self, id: i32, eof: bool) -> Option<SocketEvent> {
        let slot = self.shared.slot(id);
        let mut guard = slot.core.lock().expect("socket lock poisoned");
        let core = guard.as_mut()?;
        let opaque = core.opaque;

        if eof {
            let first_report = !core.close_sent;
            core.close_sent = true;
            self.force_close(slot, &mut guard);
            return first_report.then_some(SocketEvent::Close { id, opaque });
        }

        let err = match getsockopt(core.fd.as_ref()?, sockopt::SocketError) {
            Ok(0) => "unknown error".to_string(),
            Ok(raw) => Errno::from_raw(raw).to_string(),
            Err(e) => e.to_string(),
        };

        self.force_close(slot, &mut guard);
        Some(SocketEvent::Error { id, opaque, err })
    }

    // -- plumbing ------------------------------------------------------

    fn register(&self, core: &SocketCore) -> Result<(), Error> {
        let fd = core.fd.as_ref().expect("registering a live socket");
        self.epoll
            .add(fd, EpollEvent::new(interest(core), core.id as u32 as u64))?;
        Ok(())
    }

    fn enable_read(&self, core: &mut SocketCore, on: bool) {
        if core.read_enabled != on {
            core.read_enabled = on;
            self.update_interest(core);
        }
    }

    /// State-deduplicated: repeated enables collapse into one epoll_ctl.
    fn enable_write(&self, core: &mut SocketCore, on: bool) {
        if core.write_enabled != on {
            core.write_enabled = on;
            self.update_interest(core);
        }
    }

    fn update_interest(&self, core: &SocketCore) {
        let Some(fd) = core.fd.as_ref() else {
            return;
        };

        let mut event = EpollEvent::new(interest(core), core.id as u32 as u64);
        if let Err(e) = self.epoll.modify(fd, &mut event) {
            error!("epoll modify for socket {}: {e}", core.id);
        }
    }

    fn check_warning(&self, core: &mut SocketCore) -> Option<SocketEvent> {
        if core.wb_size < WARNING_SIZE || core.wb_size < core.warn_size {
            return None;
        }

        core.warn_size = if core.warn_size == 0 {
            WARNING_SIZE * 2
        } else {
            core.warn_size * 2
        };

        Some(SocketEvent::Warning {
            id: core.id,
            opaque: core.opaque,
            kb: core.wb_size.div_ceil(1024),
        })
    }

    /// Unregister, close, and recycle the slot. Emitting any final event is
    /// the caller's business.
    fn force_close(&self, slot: &Slot, guard: &mut MutexGuard<'_, Option<SocketCore>>) {
        if let Some(core) = guard.take() {
            if let Some(fd) = core.fd.as_ref() {
                let _ = self.epoll.delete(fd);
            }
            // Dropping the core closes the fd and frees both bands.
        }
        slot.id.store(0, Ordering::Release);
        slot.set_state(State::Invalid);
    }

    fn free_slot(&self, id: i32) {
        let slot = self.shared.slot(id);
        let mut guard = slot.core.lock().expect("socket lock poisoned");
        self.force_close(slot, &mut guard);
    }
}

enum UnitProgress {
    Done(usize),
    Partial(usize),
    WouldBlock,
    /// Datagram-only: this unit is unsendable but the socket survives.
    DropUnit(Errno),
    Fatal(Errno),
}

fn write_unit(fd: &OwnedFd, unit: &mut WriteBuffer, fallback_peer: Option<UdpAddress>) -> UnitProgress {
    if let Some(peer) = unit.address.or(fallback_peer) {
        return match send_datagram(fd, &unit.data[unit.offset..], &peer) {
            Ok(()) => UnitProgress::Done(unit.remaining()),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => UnitProgress::WouldBlock,
            Err(e) => UnitProgress::DropUnit(e),
        };
    }

    match nix::unistd::write(fd, &unit.data[unit.offset..]) {
        Ok(n) => {
            unit.offset += n;
            if unit.remaining() == 0 {
                UnitProgress::Done(n)
            } else {
                UnitProgress::Partial(n)
            }
        }
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => UnitProgress::WouldBlock,
        Err(e) => UnitProgress::Fatal(e),
    }
}

fn interest(core: &SocketCore) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if core.read_enabled {
        flags |= EpollFlags::EPOLLIN;
    }
    if core.write_enabled {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

fn connect_addr(fd: &OwnedFd, addr: &SocketAddr) -> Result<(), Errno> {
    use nix::sys::socket::{connect, SockaddrIn, SockaddrIn6};

    match addr {
        SocketAddr::V4(v4) => connect(fd.as_raw_fd(), &SockaddrIn::from(*v4)),
        SocketAddr::V6(v6) => connect(fd.as_raw_fd(), &SockaddrIn6::from(*v6)),
    }
}

fn peer_string(fd: RawFd) -> Option<String> {
    let addr = getpeername::<SockaddrStorage>(fd).ok()?;
    crate::sockaddr_to_std(&addr).map(|a| a.to_string())
}

fn open_reserve_fd() -> Option<OwnedFd> {
    std::fs::File::open("/dev/null").ok().map(Into::into)
}
