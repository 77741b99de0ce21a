//! REPLIER socket implementation.
//!
//! A listening server multiplexing many inbound peers. Requests are
//! served in the order their engines became readable; the reply goes
//! back to the engine the last request came from, never anywhere else.
//! Alternation is the mirror of the requester's: recv, then send.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;

use capstan_core::{CapstanError, Command, EngineId, IoLoop, Mailbox, Result, SocketOptions};

use crate::engine::SendItem;
use crate::pattern::{self, ConnectionMap, EngineSlot, Pattern};

pub struct Replier {
    io_loop: IoLoop,
    mailbox: Arc<Mailbox>,
    connections: ConnectionMap,
    recv_queue: VecDeque<EngineId>,
    last_engine: Option<EngineId>,
    should_recv: bool,
    closing: bool,
    listener_fd: RawFd,
    local_addr: SocketAddr,
}

impl Replier {
    /// Bind the listener and start accepting.
    pub fn bind(
        io_loop: IoLoop,
        mailbox: Arc<Mailbox>,
        options: SocketOptions,
        addr: SocketAddr,
    ) -> Result<Self> {
        let listener = pattern::bind_listener(addr)?;
        let local_addr = listener.local_addr().map_err(CapstanError::from)?;
        let listener_fd = listener.as_raw_fd();
        let connections: ConnectionMap = Arc::new(Mutex::new(HashMap::new()));
        pattern::register_acceptor(&io_loop, listener, &mailbox, &connections, options)?;
        Ok(Self {
            io_loop,
            mailbox,
            connections,
            recv_queue: VecDeque::new(),
            last_engine: None,
            should_recv: true,
            closing: false,
            listener_fd,
            local_addr,
        })
    }

    fn slot(&self, engine: EngineId) -> Option<Arc<EngineSlot>> {
        self.connections.lock().get(&engine).cloned()
    }
}

impl Pattern for Replier {
    fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.io_loop.unregister(self.listener_fd);

        let connections = self.connections.lock();
        if connections.is_empty() {
            drop(connections);
            let _ = self.mailbox.send(Command::Finalize);
            return;
        }
        for slot in connections.values() {
            if !slot.send_pipe.force_write(SendItem::Done) {
                slot.engine.activate_send();
            }
        }
    }

    fn send(&mut self, data: Bytes) -> Result<()> {
        if self.should_recv {
            return Err(CapstanError::InconsistentState(
                "replier must receive a request before sending",
            ));
        }
        let Some(last) = self.last_engine else {
            return Err(CapstanError::InconsistentState(
                "replier has no request to answer",
            ));
        };
        let Some(slot) = self.slot(last) else {
            // The peer vanished after its request was consumed; there is
            // nowhere to route the reply.
            self.should_recv = true;
            return Err(CapstanError::InconsistentState(
                "reply target disconnected",
            ));
        };
        if !slot.out_active.load(Ordering::Relaxed) {
            return Err(CapstanError::Again);
        }
        match slot.send_pipe.write(SendItem::Data(data)) {
            Ok(was_readable) => {
                if !was_readable {
                    slot.engine.activate_send();
                }
                self.should_recv = true;
                Ok(())
            }
            Err(e) => {
                slot.out_active.store(false, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn recv(&mut self) -> Result<Bytes> {
        if !self.should_recv {
            return Err(CapstanError::InconsistentState(
                "replier must send the reply before receiving again",
            ));
        }
        loop {
            let Some(&engine_id) = self.recv_queue.front() else {
                return Err(CapstanError::Again);
            };
            let Some(slot) = self.slot(engine_id) else {
                // Engine closed while queued.
                self.recv_queue.pop_front();
                continue;
            };
            match slot.recv_pipe.read() {
                Ok((data, _)) => {
                    self.last_engine = Some(engine_id);
                    if !slot.recv_pipe.read_available() {
                        self.recv_queue.pop_front();
                        slot.engine.activate_recv();
                    }
                    self.should_recv = false;
                    return Ok(data);
                }
                Err(_) => {
                    self.recv_queue.pop_front();
                }
            }
        }
    }

    fn send_available(&mut self) -> bool {
        self.last_engine
            .and_then(|id| self.slot(id))
            .is_some_and(|slot| slot.out_active.load(Ordering::Relaxed))
    }

    fn recv_available(&mut self) -> bool {
        !self.recv_queue.is_empty()
    }

    fn activate_send(&mut self, engine: EngineId) {
        if let Some(slot) = self.slot(engine) {
            slot.out_active.store(true, Ordering::Relaxed);
        }
    }

    fn activate_recv(&mut self, engine: EngineId) {
        self.recv_queue.push_back(engine);
    }

    fn connection_close(&mut self, engine: EngineId) {
        if self.last_engine == Some(engine) {
            // The pending reply has no destination anymore.
            self.should_recv = true;
        }
        let slot = self.connections.lock().remove(&engine);
        if let Some(slot) = slot {
            slot.recv_pipe.clear();
            slot.send_pipe.clear();
        }
        if self.closing && self.connections.lock().is_empty() {
            let _ = self.mailbox.send(Command::Finalize);
        }
    }

    fn connection_finalize(&mut self) {
        self.recv_queue.clear();
        self.connections.lock().clear();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}
