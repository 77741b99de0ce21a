//! REQUESTER socket implementation.
//!
//! A dialing client with enforced alternation: every `send` must be
//! answered by a `recv` before the next `send`. One engine, one
//! connection.
//!
//! State machine:
//! ```text
//! ready-to-send -> send() -> awaiting-reply -> recv() -> ready-to-send
//! ```
//! Calling out of order fails with an inconsistent-state error.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use capstan_core::{
    CapstanError, Command, EngineId, IoLoop, Mailbox, Pipe, Result, SocketOptions, SocketStream,
};

use crate::engine::{SendItem, StreamEngine};
use crate::pattern::Pattern;

pub struct Requester {
    engine: Arc<StreamEngine>,
    recv_pipe: Arc<Pipe<Bytes>>,
    send_pipe: Arc<Pipe<SendItem>>,
    mailbox: Arc<Mailbox>,
    recv_activated: bool,
    send_activated: bool,
    should_send: bool,
    local_addr: Option<SocketAddr>,
}

impl Requester {
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
            recv_activated: true,
            send_activated: true,
            should_send: true,
            local_addr: None,
        }
    }
}

impl Pattern for Requester {
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
        if !self.should_send {
            return Err(CapstanError::InconsistentState(
                "requester must receive the reply before sending again",
            ));
        }
        if !self.send_activated {
            return Err(CapstanError::Again);
        }
        match self.send_pipe.write(SendItem::Data(data)) {
            Ok(was_readable) => {
                if !was_readable {
                    // The pipe was idle; restart the sender unit.
                    self.engine.activate_send();
                }
                self.should_send = false;
                Ok(())
            }
            Err(e) => {
                self.send_activated = false;
                Err(e)
            }
        }
    }

    fn recv(&mut self) -> Result<Bytes> {
        if self.should_send {
            return Err(CapstanError::InconsistentState(
                "requester must send a request before receiving",
            ));
        }
        if !self.recv_activated {
            return Err(CapstanError::Again);
        }
        match self.recv_pipe.read() {
            Ok((data, _)) => {
                self.should_send = true;
                Ok(data)
            }
            Err(e) => {
                self.recv_activated = false;
                self.engine.activate_recv();
                Err(e)
            }
        }
    }

    fn send_available(&mut self) -> bool {
        self.send_activated = self.send_pipe.write_available();
        self.send_activated
    }

    fn recv_available(&mut self) -> bool {
        self.recv_activated = self.recv_pipe.read_available();
        self.recv_activated
    }

    fn activate_send(&mut self, _engine: EngineId) {
        self.send_activated = true;
    }

    fn activate_recv(&mut self, _engine: EngineId) {
        self.recv_activated = true;
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
