//! The uniform surface the socket facade drives.
//!
//! Each socket type is a state machine over the same building blocks:
//! a mailbox, one or more stream engines, and their pipes. The facade
//! serializes access; implementations never block.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use mio::net::TcpListener;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use capstan_core::{
    CapstanError, EngineId, EventSet, IoLoop, Mailbox, Pipe, Result, SocketOptions, SocketStream,
};

use crate::engine::{SendItem, StreamEngine};

/// Listen backlog for bound sockets.
pub(crate) const BACKLOG: i32 = 128;

/// Socket pattern identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Dialing client with strict send/recv alternation.
    Requester,
    /// Listening server answering one request at a time per peer.
    Replier,
    /// Dialing client that only sends.
    Pusher,
    /// Listening server that only receives.
    Puller,
}

impl SocketType {
    #[must_use]
    pub const fn can_bind(self) -> bool {
        matches!(self, Self::Replier | Self::Puller)
    }

    #[must_use]
    pub const fn can_connect(self) -> bool {
        matches!(self, Self::Requester | Self::Pusher)
    }
}

/// One socket pattern implementation.
///
/// All methods are non-blocking: `Again` signals "not now", and the
/// facade decides whether to wait on the mailbox or surface it.
pub trait Pattern: Send {
    /// Start connecting. Only dialing patterns implement this.
    fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        let _ = addr;
        Err(CapstanError::InconsistentState(
            "socket type does not support connect",
        ))
    }

    /// Begin teardown: push the drain sentinel to every engine.
    fn close(&mut self);

    fn send(&mut self, data: Bytes) -> Result<()>;

    fn recv(&mut self) -> Result<Bytes>;

    fn send_available(&mut self) -> bool;

    fn recv_available(&mut self) -> bool;

    /// Mailbox dispatch: the engine drained past its low watermark.
    fn activate_send(&mut self, engine: EngineId);

    /// Mailbox dispatch: the engine's receive pipe became readable.
    fn activate_recv(&mut self, engine: EngineId);

    /// Mailbox dispatch: an outbound connect completed.
    fn connected(&mut self, local_addr: Option<SocketAddr>) {
        let _ = local_addr;
    }

    /// Mailbox dispatch: the engine closed, by request or failure.
    fn connection_close(&mut self, engine: EngineId);

    /// Mailbox dispatch: all engines are gone, release bookkeeping.
    fn connection_finalize(&mut self);

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Per-connection bookkeeping for the accepting patterns.
pub(crate) struct EngineSlot {
    pub(crate) engine: Arc<StreamEngine>,
    pub(crate) recv_pipe: Arc<Pipe<Bytes>>,
    pub(crate) send_pipe: Arc<Pipe<SendItem>>,
    /// Whether the engine's send pipe is believed writable.
    pub(crate) out_active: AtomicBool,
}

/// Shared between the pattern (user thread) and the accept handler
/// (reactor thread).
pub(crate) type ConnectionMap = Arc<Mutex<HashMap<EngineId, Arc<EngineSlot>>>>;

/// Bind a non-blocking listener with `SO_REUSEADDR`.
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(CapstanError::from)?;
    socket.set_reuse_address(true).map_err(CapstanError::from)?;
    socket.bind(&addr.into()).map_err(CapstanError::from)?;
    socket.listen(BACKLOG).map_err(CapstanError::from)?;
    socket.set_nonblocking(true).map_err(CapstanError::from)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Install the accept handler for a bound pattern. Every inbound
/// connection gets its own engine and pipes; the engine starts reading
/// immediately.
pub(crate) fn register_acceptor(
    io_loop: &IoLoop,
    listener: TcpListener,
    mailbox: &Arc<Mailbox>,
    connections: &ConnectionMap,
    options: SocketOptions,
) -> Result<()> {
    let fd = listener.as_raw_fd();
    let accept_loop = io_loop.clone();
    let accept_mailbox = Arc::clone(mailbox);
    let accept_connections = Arc::clone(connections);
    io_loop.register(fd, EventSet::READABLE, move |_fd, _events| {
        accept_pending(
            &listener,
            &accept_loop,
            &accept_mailbox,
            &accept_connections,
            options,
        )
    })
}

fn accept_pending(
    listener: &TcpListener,
    io_loop: &IoLoop,
    mailbox: &Arc<Mailbox>,
    connections: &ConnectionMap,
    options: SocketOptions,
) -> Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, _peer)) => {
                let stream = SocketStream::from_accepted(io_loop.clone(), stream);
                let recv_pipe = Arc::new(Pipe::new(options.recv_hwm));
                let send_pipe = Arc::new(Pipe::new(options.send_hwm));
                let engine = StreamEngine::new(
                    io_loop.clone(),
                    stream,
                    Arc::clone(&recv_pipe),
                    Arc::clone(&send_pipe),
                    Arc::clone(mailbox),
                );
                let slot = Arc::new(EngineSlot {
                    engine: Arc::clone(&engine),
                    recv_pipe,
                    send_pipe,
                    out_active: AtomicBool::new(true),
                });
                connections.lock().insert(engine.id(), slot);
                engine.activate_recv();
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}
