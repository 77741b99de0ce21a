//! PUSH/PULL pipeline: fan-in from many dialers, per-engine ordering,
//! and drain on close.

use std::collections::HashMap;
use std::thread;

use capstan::{Context, SocketType};

const WORKERS: usize = 8;
const MESSAGES_PER_WORKER: usize = 25;
const MESSAGE_LEN: usize = 64 * 1024;

fn worker_message(worker: u8, seq: u8) -> Vec<u8> {
    let mut message = vec![worker; MESSAGE_LEN];
    message[0] = worker;
    message[1] = seq;
    message
}

#[test]
fn many_pushers_fan_into_one_puller() {
    capstan::dev_tracing::init_tracing();
    let ctx = Context::new().unwrap();

    let puller = ctx.socket(SocketType::Puller).unwrap();
    puller.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = puller.local_addr().unwrap();

    let mut workers = Vec::new();
    for worker in 0..WORKERS as u8 {
        let ctx = ctx.clone();
        workers.push(thread::spawn(move || {
            let pusher = ctx.socket(SocketType::Pusher).unwrap();
            pusher.connect(addr).unwrap();
            for seq in 0..MESSAGES_PER_WORKER as u8 {
                pusher.send(worker_message(worker, seq)).unwrap();
            }
            pusher.close().unwrap();
        }));
    }

    let mut counts: HashMap<u8, u8> = HashMap::new();
    for _ in 0..WORKERS * MESSAGES_PER_WORKER {
        let message = puller.recv().unwrap();
        assert_eq!(message.len(), MESSAGE_LEN);
        let worker = message[0];
        let seq = message[1];

        // Per-engine order: sequence numbers arrive ascending.
        let next = counts.entry(worker).or_insert(0);
        assert_eq!(seq, *next, "worker {worker} delivered out of order");
        *next += 1;

        assert!(message[2..].iter().all(|&b| b == worker));
    }

    assert_eq!(counts.len(), WORKERS);
    for (_, count) in counts {
        assert_eq!(count as usize, MESSAGES_PER_WORKER);
    }

    for worker in workers {
        worker.join().unwrap();
    }

    // Everything sent has been consumed: nothing is pending.
    assert!(puller.try_recv().unwrap_err().is_again());

    puller.close().unwrap();
    ctx.stop();
}

#[test]
fn pipeline_respects_watermarks_end_to_end() {
    let ctx = Context::new().unwrap();

    let puller = ctx.socket(SocketType::Puller).unwrap();
    puller.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = puller.local_addr().unwrap();

    let pusher = ctx
        .socket_with(SocketType::Pusher, capstan::SocketOptions::with_hwm(4))
        .unwrap();
    pusher.connect(addr).unwrap();

    let producer = thread::spawn(move || {
        for seq in 0..200u8 {
            pusher.send(vec![seq; 512]).unwrap();
        }
        pusher.close().unwrap();
    });

    for seq in 0..200u8 {
        let message = puller.recv().unwrap();
        assert_eq!(message.len(), 512);
        assert!(message.iter().all(|&b| b == seq));
    }

    producer.join().unwrap();
    puller.close().unwrap();
    ctx.stop();
}

#[test]
fn pull_socket_rejects_send() {
    let ctx = Context::new().unwrap();
    let puller = ctx.socket(SocketType::Puller).unwrap();
    puller.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let err = puller.send(&b"nope"[..]).unwrap_err();
    assert!(matches!(err, capstan::CapstanError::InconsistentState(_)));

    puller.close().unwrap();
    ctx.stop();
}
