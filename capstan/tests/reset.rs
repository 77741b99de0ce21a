//! Peer-induced connection teardown as seen from the facade.

use std::io::Read;
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use capstan::{CapstanError, Context, SocketType};

#[test]
fn peer_reset_fails_pending_recv_then_closes_the_socket() {
    capstan::dev_tracing::init_tracing();
    let ctx = Context::new().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = ctx.socket(SocketType::Requester).unwrap();
    client.connect(addr).unwrap();
    client.send(&b"ping"[..]).unwrap();

    // Consume the request, then tear the connection down while the
    // requester is blocked waiting for the reply.
    let (mut peer, _) = listener.accept().unwrap();
    let mut header = [0u8; 5];
    peer.read_exact(&mut header).unwrap();
    let packet_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut body = vec![0u8; packet_len - 5];
    peer.read_exact(&mut body).unwrap();
    assert_eq!(&body, b"ping");

    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        drop(peer);
    });

    // The blocked recv returns with the wrapped socket error instead of
    // hanging; reset-family errno, so it was not re-raised as-is.
    let err = client.recv().unwrap_err();
    assert!(matches!(err, CapstanError::Stream(Some(_))));
    assert!(err.is_reset());

    // The socket finished closing; everything after fails cleanly.
    let err = client.send(&b"again"[..]).unwrap_err();
    assert!(matches!(err, CapstanError::ConnectionClosed));
    let err = client.recv().unwrap_err();
    assert!(matches!(err, CapstanError::ConnectionClosed));

    killer.join().unwrap();
    ctx.stop();
}

#[test]
fn connect_to_dead_port_raises_connection_error() {
    let ctx = Context::new().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ctx.socket(SocketType::Requester).unwrap();
    let err = client.connect(addr).unwrap_err();
    assert!(matches!(err, CapstanError::Connection(_)));

    ctx.stop();
}
