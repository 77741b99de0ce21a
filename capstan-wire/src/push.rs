//! PUSHER socket implementation.
//!
//! The send-only half of the pipeline pattern: a dialing client
//! streaming messages to one bound puller. No ordering constraints
//! between sends; backpressure arrives through the send pipe's high
//! watermark.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use capstan_core::{
    CapstanError, Command, EngineId, IoLoop, Mailbox, Pipe, Result, SocketOptions, SocketStream,
};

use crate::engine::{SendItem, StreamEngine};
use crate::pattern::Pattern;

pub struct Pusher {
    engine: Arc<StreamEngine>,
    recv_pipe: Arc<Pipe<Bytes>>,
    send_pipe: Arc<Pipe<SendItem>>,
    mailbox: Arc<Mailbox>,
    send_activated: bool,
    local_addr: Option<SocketAddr>,
}

impl Pusher {
    #[must_use]
    pub fn new(io_loop: IoLoop, mailbox: Arc<Mailbox>, options: SocketOptions) -> Self {
        let stream = SocketStream::new(io_loop.clone());
        let recv_pipe = Arc::new(Pipe::new(options.recv_hwm));
        let send_pipe = Arc::new(Pipe::new(options.send_hwm));
        let engine = StreamEngine::new(
            io_loop,
            stream,
            Arc::clone(&recv_pipe),
            Arc::clone(&send_pipe),
            Arc::clone(&mailbox),
        );
        Self {
            engine,
            recv_pipe,
            send_pipe,
            mailbox,
            send_activated: true,
            local_addr: None,
        }
    }
}

impl Pattern for Pusher {
    fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        self.engine.activate_connect(addr);
        Ok(())
    }

    fn close(&mut self) {
        if !self.send_pipe.force_write(SendItem::Done) {
            self.engine.activate_send();
        }
        self.send_activated = false;
    }

    fn send(&mut self, data: Bytes) -> Result<()> {
        if !self.send_activated {
            return Err(CapstanError::Again);
        }
        match self.send_pipe.write(SendItem::Data(data)) {
            Ok(was_readable) => {
                if !was_readable {
                    self.engine.activate_send();
                }
                Ok(())
            }
            Err(e) => {
                self.send_activated = false;
                Err(e)
            }
        }
    }

    fn recv(&mut self) -> Result<Bytes> {
        Err(CapstanError::InconsistentState(
            "push socket cannot receive",
        ))
    }

    fn send_available(&mut self) -> bool {
        self.send_activated = self.send_pipe.write_available();
        self.send_activated
    }

    fn recv_available(&mut self) -> bool {
        false
    }

    fn activate_send(&mut self, _engine: EngineId) {
        self.send_activated = true;
    }

    fn activate_recv(&mut self, engine: EngineId) {
        debug!(engine, "ignoring recv activation on push socket");
    }

    fn connected(&mut self, local_addr: Option<SocketAddr>) {
        self.local_addr = local_addr;
    }

    fn connection_close(&mut self, _engine: EngineId) {
        self.recv_pipe.clear();
        self.send_pipe.clear();
        let _ = self.mailbox.send(Command::Finalize);
    }

    fn connection_finalize(&mut self) {
        self.recv_pipe.clear();
        self.send_pipe.clear();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}
