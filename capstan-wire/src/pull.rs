//! PULLER socket implementation.
//!
//! The receive-only half of the pipeline pattern: a listening server
//! fanning in messages from many pushers. Engines are served in the
//! order they became readable, which approximates round-robin under
//! sustained load. There is no send side.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use capstan_core::{CapstanError, Command, EngineId, IoLoop, Mailbox, Result, SocketOptions};

use crate::engine::SendItem;
use crate::pattern::{self, ConnectionMap, EngineSlot, Pattern};

pub struct Puller {
    io_loop: IoLoop,
    mailbox: Arc<Mailbox>,
    connections: ConnectionMap,
    recv_queue: VecDeque<EngineId>,
    closing: bool,
    listener_fd: RawFd,
    local_addr: SocketAddr,
}

impl Puller {
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
            closing: false,
            listener_fd,
            local_addr,
        })
    }

    fn slot(&self, engine: EngineId) -> Option<Arc<EngineSlot>> {
        self.connections.lock().get(&engine).cloned()
    }
}

impl Pattern for Puller {
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

    fn send(&mut self, _data: Bytes) -> Result<()> {
        Err(CapstanError::InconsistentState("pull socket cannot send"))
    }

    fn recv(&mut self) -> Result<Bytes> {
        loop {
            let Some(&engine_id) = self.recv_queue.front() else {
                return Err(CapstanError::Again);
            };
            let Some(slot) = self.slot(engine_id) else {
                self.recv_queue.pop_front();
                continue;
            };
            match slot.recv_pipe.read() {
                Ok((data, _)) => {
                    if !slot.recv_pipe.read_available() {
                        self.recv_queue.pop_front();
                        slot.engine.activate_recv();
                    }
                    return Ok(data);
                }
                Err(_) => {
                    self.recv_queue.pop_front();
                }
            }
        }
    }

    fn send_available(&mut self) -> bool {
        false
    }

    fn recv_available(&mut self) -> bool {
        !self.recv_queue.is_empty()
    }

    fn activate_send(&mut self, engine: EngineId) {
        // Pull engines never carry outbound payloads.
        debug!(engine, "ignoring send activation on pull socket");
    }

    fn activate_recv(&mut self, engine: EngineId) {
        self.recv_queue.push_back(engine);
    }

    fn connection_close(&mut self, engine: EngineId) {
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
