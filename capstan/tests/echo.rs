//! Request/reply round trips between REQUESTER and REPLIER sockets.

use bytes::Bytes;
use capstan::{CapstanError, Context, SocketType};

fn req_rep_pair(ctx: &Context) -> (capstan::Socket, capstan::Socket) {
    let server = ctx.socket(SocketType::Replier).unwrap();
    server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let client = ctx.socket(SocketType::Requester).unwrap();
    client.connect(addr).unwrap();
    (client, server)
}

#[test]
fn echo_round_trip() {
    capstan::dev_tracing::init_tracing();
    let ctx = Context::new().unwrap();
    let (client, server) = req_rep_pair(&ctx);

    let payload = vec![b'a'; 1024];
    client.send(payload.clone()).unwrap();
    let request = server.recv().unwrap();
    assert_eq!(&request[..], &payload[..]);
    server.send(request).unwrap();
    let reply = client.recv().unwrap();
    assert_eq!(&reply[..], &payload[..]);

    client.close().unwrap();
    server.close().unwrap();
    ctx.stop();
}

#[test]
fn fragmented_message_reassembles() {
    use rand::{Rng, SeedableRng};
    let ctx = Context::new().unwrap();
    let (client, server) = req_rep_pair(&ctx);

    // Well past the 128 KiB packet bound: at least 8 frames.
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let payload: Vec<u8> = (0..1024 * 1024).map(|_| rng.gen()).collect();
    client.send(payload.clone()).unwrap();
    let request = server.recv().unwrap();
    assert_eq!(request.len(), payload.len());
    assert_eq!(&request[..], &payload[..]);
    server.send(request).unwrap();
    let reply = client.recv().unwrap();
    assert_eq!(&reply[..], &payload[..]);

    client.close().unwrap();
    server.close().unwrap();
    ctx.stop();
}

#[test]
fn repeated_round_trips_on_one_connection() {
    let ctx = Context::new().unwrap();
    let (client, server) = req_rep_pair(&ctx);

    for i in 0..100u32 {
        let payload = i.to_be_bytes().to_vec();
        client.send(payload.clone()).unwrap();
        let request = server.recv().unwrap();
        server.send(request).unwrap();
        let reply = client.recv().unwrap();
        assert_eq!(&reply[..], &payload[..]);
    }

    client.close().unwrap();
    server.close().unwrap();
    ctx.stop();
}

#[test]
fn requester_alternation_is_enforced() {
    let ctx = Context::new().unwrap();
    let (client, server) = req_rep_pair(&ctx);

    let err = client.recv().unwrap_err();
    assert!(matches!(err, CapstanError::InconsistentState(_)));

    client.send(&b"one"[..]).unwrap();
    let err = client.send(&b"two"[..]).unwrap_err();
    assert!(matches!(err, CapstanError::InconsistentState(_)));

    // The connection still works after the misuse.
    let request = server.recv().unwrap();
    server.send(request).unwrap();
    assert_eq!(&client.recv().unwrap()[..], b"one");

    client.close().unwrap();
    server.close().unwrap();
    ctx.stop();
}

#[test]
fn replier_alternation_is_enforced() {
    let ctx = Context::new().unwrap();
    let (client, server) = req_rep_pair(&ctx);

    let err = server.send(&b"unsolicited"[..]).unwrap_err();
    assert!(matches!(err, CapstanError::InconsistentState(_)));

    client.send(&b"ping"[..]).unwrap();
    let request = server.recv().unwrap();
    let err = server.recv().unwrap_err();
    assert!(matches!(err, CapstanError::InconsistentState(_)));
    server.send(request).unwrap();
    client.recv().unwrap();

    client.close().unwrap();
    server.close().unwrap();
    ctx.stop();
}

#[test]
fn reply_routes_to_the_requesting_peer() {
    let ctx = Context::new().unwrap();
    let server = ctx.socket(SocketType::Replier).unwrap();
    server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let alice = ctx.socket(SocketType::Requester).unwrap();
    alice.connect(addr).unwrap();
    let bob = ctx.socket(SocketType::Requester).unwrap();
    bob.connect(addr).unwrap();

    alice.send(&b"from-alice"[..]).unwrap();
    bob.send(&b"from-bob"[..]).unwrap();

    // Answer both requests before either client reads: each reply must
    // land on the engine its request came from.
    for _ in 0..2 {
        let request = server.recv().unwrap();
        let mut reply = request.to_vec();
        reply.extend_from_slice(b"/ack");
        server.send(reply).unwrap();
    }

    assert_eq!(&alice.recv().unwrap()[..], b"from-alice/ack");
    assert_eq!(&bob.recv().unwrap()[..], b"from-bob/ack");

    alice.close().unwrap();
    bob.close().unwrap();
    server.close().unwrap();
    ctx.stop();
}

#[test]
fn poll_reports_readiness_bits() {
    use capstan::EventSet;
    let ctx = Context::new().unwrap();
    let (client, server) = req_rep_pair(&ctx);

    let both = EventSet::READABLE | EventSet::WRITABLE;
    // A fresh requester can send but has nothing to read.
    assert_eq!(client.poll(both), EventSet::WRITABLE);

    client.send(&b"ping"[..]).unwrap();
    server.recv().unwrap();
    // A request is pending an answer: the replier can write.
    assert!(server.poll(both).is_writable());
    server.send(&b"pong"[..]).unwrap();
    client.recv().unwrap();

    client.close().unwrap();
    server.close().unwrap();
    ctx.stop();
}

#[test]
fn try_recv_reports_again() {
    let ctx = Context::new().unwrap();
    let (client, server) = req_rep_pair(&ctx);

    assert!(server.try_recv().unwrap_err().is_again());

    client.send(&b"x"[..]).unwrap();
    let request = loop {
        match server.try_recv() {
            Ok(request) => break request,
            Err(e) if e.is_again() => std::thread::yield_now(),
            Err(e) => panic!("unexpected error {e}"),
        }
    };
    assert_eq!(&request[..], b"x");

    server.send(Bytes::from_static(b"y")).unwrap();
    assert_eq!(&client.recv().unwrap()[..], b"y");

    client.close().unwrap();
    server.close().unwrap();
    ctx.stop();
}
