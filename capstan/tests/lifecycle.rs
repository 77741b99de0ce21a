//! Socket and context lifecycle: state transitions, addresses, and
//! shutdown.

use capstan::{CapstanError, Context, SocketType};

#[test]
fn local_addr_reports_bound_and_dialer_addresses() {
    let ctx = Context::new().unwrap();

    let server = ctx.socket(SocketType::Replier).unwrap();
    server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();
    assert_ne!(addr.port(), 0);

    let client = ctx.socket(SocketType::Requester).unwrap();
    client.connect(addr).unwrap();
    let client_addr = client.local_addr().unwrap();
    assert_ne!(client_addr.port(), 0);
    assert_ne!(client_addr.port(), addr.port());

    client.close().unwrap();
    server.close().unwrap();
    ctx.stop();
}

#[test]
fn type_mismatched_operations_are_rejected() {
    let ctx = Context::new().unwrap();

    let requester = ctx.socket(SocketType::Requester).unwrap();
    assert!(matches!(
        requester.bind("127.0.0.1:0".parse().unwrap()),
        Err(CapstanError::InconsistentState(_))
    ));

    let puller = ctx.socket(SocketType::Puller).unwrap();
    assert!(matches!(
        puller.connect("127.0.0.1:1".parse().unwrap()),
        Err(CapstanError::InconsistentState(_))
    ));

    ctx.stop();
}

#[test]
fn reopening_an_open_socket_fails() {
    let ctx = Context::new().unwrap();

    let server = ctx.socket(SocketType::Replier).unwrap();
    server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    assert!(matches!(
        server.bind("127.0.0.1:0".parse().unwrap()),
        Err(CapstanError::ConnectionInUse)
    ));

    server.close().unwrap();
    ctx.stop();
}

#[test]
fn closed_socket_rejects_everything() {
    let ctx = Context::new().unwrap();

    let server = ctx.socket(SocketType::Replier).unwrap();
    server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    server.close().unwrap();

    assert!(matches!(
        server.close(),
        Err(CapstanError::ConnectionClosed)
    ));
    assert!(matches!(
        server.recv(),
        Err(CapstanError::ConnectionClosed)
    ));
    assert!(matches!(
        server.send(&b"x"[..]),
        Err(CapstanError::ConnectionClosed)
    ));
    assert!(server.local_addr().is_err());

    ctx.stop();
}

#[test]
fn unused_socket_never_opened_rejects_io() {
    let ctx = Context::new().unwrap();
    let socket = ctx.socket(SocketType::Requester).unwrap();

    // Never bound or connected: idle sockets cannot move data.
    assert!(socket.recv().is_err());
    assert!(socket.send(&b"x"[..]).is_err());

    ctx.stop();
}

#[test]
fn run_in_background_executes_on_the_reactor() {
    let ctx = Context::new().unwrap();
    let (tx, rx) = flume::bounded(1);
    ctx.run_in_background(move || {
        let _ = tx.send(std::thread::current().name().map(String::from));
    });
    let name = rx
        .recv_timeout(std::time::Duration::from_secs(2))
        .unwrap();
    assert_eq!(name.as_deref(), Some("capstan-io"));
    ctx.stop();
}

#[test]
fn context_stop_is_idempotent() {
    let ctx = Context::new().unwrap();
    ctx.stop();
    ctx.stop();
    assert!(ctx.socket(SocketType::Requester).is_err());
}
