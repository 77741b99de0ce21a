//! Stream engine against a scripted raw TCP peer: framing on the wire,
//! reassembly, activation signaling, and teardown commands.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use capstan_core::{Command, IoLoop, Mailbox, Pipe, SocketStream};
use capstan_wire::{encode_frames, SendItem, StreamEngine};

const RECV_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn read_message_raw(peer: &mut TcpStream) -> Vec<u8> {
    let mut message = Vec::new();
    loop {
        let mut header = [0u8; 5];
        peer.read_exact(&mut header).unwrap();
        let flags = header[0];
        let packet_len =
            u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut body = vec![0u8; packet_len - 5];
        peer.read_exact(&mut body).unwrap();
        message.extend_from_slice(&body);
        if flags & 0x01 == 0 {
            return message;
        }
    }
}

fn write_message_raw(peer: &mut TcpStream, payload: &[u8]) {
    for frame in encode_frames(Bytes::copy_from_slice(payload)) {
        peer.write_all(&frame).unwrap();
    }
}

#[test]
fn engine_round_trip_with_multi_frame_message() {
    let io_loop = IoLoop::new().unwrap();
    let runner = io_loop.clone();
    let loop_thread = thread::spawn(move || {
        let _ = runner.run();
    });

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // Large enough to need several frames each way.
    let request = vec![0x61u8; 1024 * 1024];
    let expected = request.clone();
    let server = thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        let received = read_message_raw(&mut peer);
        assert_eq!(received, expected);
        write_message_raw(&mut peer, &received);
        peer
    });

    let mailbox = Arc::new(Mailbox::new().unwrap());
    let recv_pipe = Arc::new(Pipe::unbounded());
    let send_pipe = Arc::new(Pipe::unbounded());
    let stream = SocketStream::new(io_loop.clone());
    let engine = StreamEngine::new(
        io_loop.clone(),
        stream,
        Arc::clone(&recv_pipe),
        Arc::clone(&send_pipe),
        Arc::clone(&mailbox),
    );

    engine.activate_connect(addr);
    match mailbox.recv(RECV_TIMEOUT).unwrap() {
        Command::ConnectSuccess { local_addr } => assert!(local_addr.is_some()),
        other => panic!("expected connect success, got {other:?}"),
    }

    if !send_pipe
        .write(SendItem::Data(Bytes::from(request)))
        .unwrap()
    {
        engine.activate_send();
    }
    engine.activate_recv();

    loop {
        match mailbox.recv(RECV_TIMEOUT).unwrap() {
            Command::ActivateRecv { engine: id } => {
                assert_eq!(id, engine.id());
                break;
            }
            Command::ActivateSend { .. } => {}
            other => panic!("unexpected command {other:?}"),
        }
    }
    let (reply, _) = recv_pipe.read().unwrap();
    assert_eq!(reply.len(), 1024 * 1024);
    assert!(reply.iter().all(|&b| b == 0x61));

    // Drain sentinel tears the engine down and reports CLOSED.
    if !send_pipe.force_write(SendItem::Done) {
        engine.activate_send();
    }
    loop {
        match mailbox.recv(RECV_TIMEOUT).unwrap() {
            Command::Closed { engine: id } => {
                assert_eq!(id, engine.id());
                break;
            }
            Command::ActivateSend { .. } | Command::ActivateRecv { .. } => {}
            other => panic!("unexpected command {other:?}"),
        }
    }

    drop(server.join().unwrap());
    let stopper = io_loop.clone();
    io_loop.next_tick(move || stopper.stop());
    loop_thread.join().unwrap();
}

#[test]
fn engine_reports_failed_connect() {
    let io_loop = IoLoop::new().unwrap();
    let runner = io_loop.clone();
    let loop_thread = thread::spawn(move || {
        let _ = runner.run();
    });

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mailbox = Arc::new(Mailbox::new().unwrap());
    let recv_pipe = Arc::new(Pipe::unbounded());
    let send_pipe = Arc::new(Pipe::unbounded());
    let stream = SocketStream::new(io_loop.clone());
    let engine = StreamEngine::new(
        io_loop.clone(),
        stream,
        recv_pipe,
        send_pipe,
        Arc::clone(&mailbox),
    );

    engine.activate_connect(addr);
    match mailbox.recv(RECV_TIMEOUT).unwrap() {
        Command::Error { engine: id, error } => {
            assert_eq!(id, engine.id());
            assert!(error.errno().is_some());
        }
        other => panic!("expected an error command, got {other:?}"),
    }

    let stopper = io_loop.clone();
    io_loop.next_tick(move || stopper.stop());
    loop_thread.join().unwrap();
}
