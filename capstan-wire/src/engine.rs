//! Per-connection stream engine.
//!
//! One engine per TCP connection. It owns the byte stream and mediates
//! between it and the two pipes: messages flow user -> send-pipe ->
//! wire and wire -> recv-pipe -> user. The units run as cooperative
//! tasks on the reactor; the user side only ever pokes the engine
//! through `activate_*`, which defers onto the reactor thread.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use tracing::debug;

use capstan_core::{CapstanError, Command, EngineId, IoLoop, Mailbox, Pipe, Result, SocketStream};

use crate::codec::{self, FrameHeader, FRAME_HEADER_LEN};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(0);

/// Items carried by a send pipe: payloads, and the drain sentinel that
/// tells the engine to flush and close.
#[derive(Debug)]
pub enum SendItem {
    Data(Bytes),
    Done,
}

pub struct StreamEngine {
    id: EngineId,
    io_loop: IoLoop,
    stream: SocketStream,
    recv_pipe: Arc<Pipe<Bytes>>,
    send_pipe: Arc<Pipe<SendItem>>,
    mailbox: Arc<Mailbox>,
    // Unit guards, touched only on the reactor thread.
    background_sending: AtomicBool,
    background_receiving: AtomicBool,
    closed: AtomicBool,
}

impl StreamEngine {
    pub fn new(
        io_loop: IoLoop,
        stream: SocketStream,
        recv_pipe: Arc<Pipe<Bytes>>,
        send_pipe: Arc<Pipe<SendItem>>,
        mailbox: Arc<Mailbox>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            io_loop,
            stream,
            recv_pipe,
            send_pipe,
            mailbox,
            background_sending: AtomicBool::new(false),
            background_receiving: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> EngineId {
        self.id
    }

    /// Start the connect unit for `addr`.
    pub fn activate_connect(self: &Arc<Self>, addr: SocketAddr) {
        let engine = Arc::clone(self);
        self.io_loop.next_tick(move || engine.attempt_connect(addr));
    }

    /// Kick the sender unit; a no-op while it is already running.
    pub fn activate_send(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        self.io_loop.next_tick(move || engine.attempt_send());
    }

    /// Kick the receiver unit; a no-op while it is already running.
    pub fn activate_recv(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        self.io_loop.next_tick(move || engine.attempt_recv());
    }

    fn attempt_connect(self: Arc<Self>, addr: SocketAddr) {
        let engine = Arc::clone(&self);
        self.io_loop.spawn(async move {
            match engine.stream.connect(addr).await {
                Ok(()) => {
                    let local_addr = engine.stream.local_addr();
                    engine.post(Command::ConnectSuccess { local_addr });
                }
                Err(e) => engine.fail(e),
            }
        });
    }

    fn attempt_send(self: Arc<Self>) {
        if self.background_sending.load(Ordering::Relaxed) {
            return;
        }
        let (first, lwm_reached) = match self.send_pipe.read() {
            Ok(read) => read,
            Err(_) => return,
        };
        let mut message = match first {
            SendItem::Done => {
                self.close();
                return;
            }
            SendItem::Data(data) => data,
        };
        if lwm_reached {
            self.post(Command::ActivateSend { engine: self.id });
        }
        self.background_sending.store(true, Ordering::Relaxed);

        let engine = Arc::clone(&self);
        self.io_loop.spawn(async move {
            loop {
                if let Err(e) = engine.send_message(message).await {
                    engine.background_sending.store(false, Ordering::Relaxed);
                    engine.fail(e);
                    return;
                }
                match engine.send_pipe.read() {
                    Ok((SendItem::Done, _)) => {
                        engine.background_sending.store(false, Ordering::Relaxed);
                        engine.close();
                        return;
                    }
                    Ok((SendItem::Data(data), lwm_reached)) => {
                        if lwm_reached {
                            engine.post(Command::ActivateSend { engine: engine.id });
                        }
                        message = data;
                    }
                    Err(_) => {
                        // Queue empty. Pause until the producer kicks us.
                        engine.background_sending.store(false, Ordering::Relaxed);
                        return;
                    }
                }
            }
        });
    }

    fn attempt_recv(self: Arc<Self>) {
        if self.background_receiving.swap(true, Ordering::Relaxed) {
            return;
        }
        let engine = Arc::clone(&self);
        self.io_loop.spawn(async move {
            loop {
                // Check for room first: this unit is the pipe's only
                // writer, so a positive check cannot go stale.
                if !engine.recv_pipe.write_available() {
                    engine.background_receiving.store(false, Ordering::Relaxed);
                    return;
                }
                let message = match engine.read_message().await {
                    Ok(message) => message,
                    Err(e) => {
                        engine.background_receiving.store(false, Ordering::Relaxed);
                        engine.fail(e);
                        return;
                    }
                };
                match engine.recv_pipe.write(message) {
                    Ok(was_readable) => {
                        if !was_readable {
                            engine.post(Command::ActivateRecv {
                                engine: engine.id,
                            });
                        }
                    }
                    Err(_) => {
                        engine.background_receiving.store(false, Ordering::Relaxed);
                        return;
                    }
                }
            }
        });
    }

    async fn send_message(&self, payload: Bytes) -> Result<()> {
        for frame in codec::encode_frames(payload) {
            self.stream.write(frame).await?;
        }
        Ok(())
    }

    async fn read_message(&self) -> Result<Bytes> {
        let mut parts: SmallVec<[Bytes; 4]> = SmallVec::new();
        loop {
            let header = self.stream.read_with_length(FRAME_HEADER_LEN).await?;
            let header = FrameHeader::parse(&header)?;
            let body = self.stream.read_with_length(header.body_len()).await?;
            parts.push(body);
            if !header.more() {
                break;
            }
        }
        if parts.len() == 1 {
            return Ok(parts.pop().expect("one part present"));
        }
        let total: usize = parts.iter().map(Bytes::len).sum();
        let mut message = BytesMut::with_capacity(total);
        for part in parts {
            message.extend_from_slice(&part);
        }
        Ok(message.freeze())
    }

    /// Requested teardown, reached through the Done sentinel.
    ///
    /// The closed flag guards the race with `fail`: failures are
    /// spontaneous, a close is deliberate, and only one of them may
    /// tear the engine down. When a close arrives second, the facade is
    /// already waiting for FINALIZE, so post it directly.
    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            self.post(Command::Finalize);
            return;
        }
        self.stream.close();
        self.post(Command::Closed { engine: self.id });
    }

    fn fail(&self, error: CapstanError) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.stream.close();
        self.post(Command::Error {
            engine: self.id,
            error,
        });
    }

    fn post(&self, command: Command) {
        if let Err(e) = self.mailbox.send(command) {
            debug!(engine = self.id, "mailbox send failed: {e}");
        }
    }
}
