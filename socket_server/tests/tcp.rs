// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::Duration;

use socket_server::{SocketEvent, SocketServerHandle};

const WAIT: Duration = Duration::from_secs(5);

/// Run the engine on its own thread, forwarding every event into a channel.
fn spawn_engine() -> (SocketServerHandle, mpsc::Receiver<SocketEvent>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut server, handle) = socket_server::create().unwrap();
    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || loop {
        let event = server.poll();
        let exit = matches!(event, SocketEvent::Exit);
        if tx.send(event).is_err() || exit {
            break;
        }
    });

    (handle, rx)
}

/// Receive events until `pred` accepts one, failing on timeout.
fn wait_for<F>(rx: &mpsc::Receiver<SocketEvent>, mut pred: F) -> SocketEvent
where
    F: FnMut(&SocketEvent) -> bool,
{
    loop {
        let event = rx.recv_timeout(WAIT).expect("timed out waiting for event");
        if pred(&event) {
            return event;
        }
    }
}

#[test]
fn accept_echo_close() {
    let (handle, rx) = spawn_engine();

    let (listen_id, addr) = handle.listen(1, "127.0.0.1", 0, 64).unwrap();
    assert_ne!(addr.port(), 0);
    handle.start(1, listen_id);
    wait_for(&rx, |e| matches!(e, SocketEvent::Open { id, .. } if *id == listen_id));

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"ABCD").unwrap();

    let SocketEvent::Accept { new_id, addr, .. } =
        wait_for(&rx, |e| matches!(e, SocketEvent::Accept { .. }))
    else {
        unreachable!();
    };
    assert!(addr.starts_with("127.0.0.1:"));

    // The connection delivers nothing until it is resumed.
    handle.start(2, new_id);
    wait_for(
        &rx,
        |e| matches!(e, SocketEvent::Open { id, opaque, .. } if *id == new_id && *opaque == 2),
    );

    let SocketEvent::Data { data, .. } = wait_for(
        &rx,
        |e| matches!(e, SocketEvent::Data { id, .. } if *id == new_id),
    ) else {
        unreachable!();
    };
    assert_eq!(&data[..], b"ABCD");

    // Echo back and read it on the client side.
    handle.send(new_id, data.into_vec()).unwrap();
    let mut back = [0u8; 4];
    client.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"ABCD");

    // Closing the client produces exactly one Close for that socket.
    drop(client);
    wait_for(&rx, |e| matches!(e, SocketEvent::Close { id, .. } if *id == new_id));

    handle.exit();
    let mut extra_closes = 0;
    while let Ok(event) = rx.recv_timeout(WAIT) {
        match event {
            SocketEvent::Close { id, .. } if id == new_id => extra_closes += 1,
            SocketEvent::Exit => break,
            _ => {}
        }
    }
    assert_eq!(extra_closes, 0);
}

#[test]
fn send_to_closed_id_fails_locally() {
    let (handle, rx) = spawn_engine();

    // Never-allocated ID:
    assert!(handle.send(12345, b"x".to_vec()).is_err());

    handle.exit();
    wait_for(&rx, |e| matches!(e, SocketEvent::Exit));
}

#[test]
fn large_send_queues_and_warns() {
    let (handle, rx) = spawn_engine();

    let (listen_id, addr) = handle.listen(1, "127.0.0.1", 0, 64).unwrap();
    handle.start(1, listen_id);

    let client = TcpStream::connect(addr).unwrap();
    let SocketEvent::Accept { new_id, .. } =
        wait_for(&rx, |e| matches!(e, SocketEvent::Accept { .. }))
    else {
        unreachable!();
    };
    handle.start(2, new_id);
    wait_for(&rx, |e| matches!(e, SocketEvent::Open { id, .. } if *id == new_id));

    // 5 MiB cannot fit in the kernel buffer, so most of it queues and the
    // first 1 MiB watermark is crossed.
    let payload: Vec<u8> = (0..5 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    handle.send(new_id, payload).unwrap();

    wait_for(
        &rx,
        |e| matches!(e, SocketEvent::Warning { id, kb, .. } if *id == new_id && *kb >= 1024),
    );

    // Drain everything on the client and verify nothing was truncated or
    // reordered by the staged-remainder handoff.
    let mut received = Vec::with_capacity(expected.len());
    let mut chunk = [0u8; 64 * 1024];
    let mut client = client;
    while received.len() < expected.len() {
        let n = client.read(&mut chunk).unwrap();
        assert_ne!(n, 0, "connection closed early");
        received.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(received, expected);

    handle.exit();
    wait_for(&rx, |e| matches!(e, SocketEvent::Exit));
}

#[test]
fn graceful_close_flushes_pending_data() {
    let (handle, rx) = spawn_engine();

    let (listen_id, addr) = handle.listen(1, "127.0.0.1", 0, 64).unwrap();
    handle.start(1, listen_id);

    let mut client = TcpStream::connect(addr).unwrap();
    let SocketEvent::Accept { new_id, .. } =
        wait_for(&rx, |e| matches!(e, SocketEvent::Accept { .. }))
    else {
        unreachable!();
    };
    handle.start(2, new_id);
    wait_for(&rx, |e| matches!(e, SocketEvent::Open { id, .. } if *id == new_id));

    let payload: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 241) as u8).collect();
    let expected = payload.clone();
    handle.send(new_id, payload).unwrap();
    handle.close(2, new_id);

    wait_for(&rx, |e| matches!(e, SocketEvent::Close { id, .. } if *id == new_id));

    // Everything queued before the close must still arrive, then EOF.
    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert_eq!(received, expected);

    handle.exit();
    wait_for(&rx, |e| matches!(e, SocketEvent::Exit));
}

#[test]
fn connect_to_live_listener() {
    let (handle, rx) = spawn_engine();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let id = handle
        .connect(9, "127.0.0.1", addr.port())
        .unwrap();

    let SocketEvent::Open { opaque, .. } = wait_for(
        &rx,
        |e| matches!(e, SocketEvent::Open { id: got, .. } if *got == id),
    ) else {
        unreachable!();
    };
    assert_eq!(opaque, 9);

    let (mut server_side, _) = listener.accept().unwrap();
    handle.send(id, b"ping".to_vec()).unwrap();

    let mut buf = [0u8; 4];
    server_side.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    handle.exit();
    wait_for(&rx, |e| matches!(e, SocketEvent::Exit));
}
