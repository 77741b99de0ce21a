//! The user-visible socket facade.
//!
//! A `Socket` lives on its user's thread and talks to the reactor side
//! exclusively through pipes and the mailbox. Blocking `send`/`recv`
//! first drain pending mailbox commands without waiting, attempt the
//! operation once, and on `Again` wait on the mailbox until an
//! activation lets the operation through. The `try_` variants surface
//! `Again` instead of waiting.
//!
//! Lifecycle: created idle, opened by `bind` or `connect`, `close`
//! hands the mailbox to the reaper thread, and the FINALIZE command
//! releases the descriptor and the mailbox.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use capstan_core::{CapstanError, Command, EventSet, Mailbox, Result, SocketOptions};
use capstan_wire::{Pattern, Puller, Pusher, Replier, Requester, SocketType};

use crate::context::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Open,
    Closing,
    Closed,
}

struct StateBlock {
    state: State,
    // Reset-family engine error held back for the next blocking call.
    pending_error: Option<CapstanError>,
}

struct SocketInner {
    socket_type: SocketType,
    context: Context,
    options: SocketOptions,
    mailbox: Arc<Mailbox>,
    state: Mutex<StateBlock>,
    pattern: Mutex<Option<Box<dyn Pattern>>>,
}

/// A typed messaging socket.
///
/// Cloning yields another handle to the same socket.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    pub(crate) fn new(
        context: Context,
        socket_type: SocketType,
        options: SocketOptions,
    ) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(SocketInner {
                socket_type,
                context,
                options,
                mailbox: Arc::new(Mailbox::new()?),
                state: Mutex::new(StateBlock {
                    state: State::Idle,
                    pending_error: None,
                }),
                pattern: Mutex::new(None),
            }),
        })
    }

    #[must_use]
    pub fn socket_type(&self) -> SocketType {
        self.inner.socket_type
    }

    /// Bind a listening socket (REPLIER, PULLER) to `addr`.
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.check_idle()?;
        if !self.inner.socket_type.can_bind() {
            return Err(CapstanError::InconsistentState(
                "socket type does not support bind",
            ));
        }
        let io_loop = self.inner.context.io_loop().clone();
        let mailbox = Arc::clone(&self.inner.mailbox);
        let pattern: Box<dyn Pattern> = match self.inner.socket_type {
            SocketType::Replier => {
                Box::new(Replier::bind(io_loop, mailbox, self.inner.options, addr)?)
            }
            SocketType::Puller => {
                Box::new(Puller::bind(io_loop, mailbox, self.inner.options, addr)?)
            }
            SocketType::Requester | SocketType::Pusher => unreachable!("can_bind checked"),
        };
        self.open(pattern)
    }

    /// Connect a dialing socket (REQUESTER, PUSHER) to `addr`, waiting
    /// until the connection is established.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.check_idle()?;
        if !self.inner.socket_type.can_connect() {
            return Err(CapstanError::InconsistentState(
                "socket type does not support connect",
            ));
        }
        let io_loop = self.inner.context.io_loop().clone();
        let mailbox = Arc::clone(&self.inner.mailbox);
        let pattern: Box<dyn Pattern> = match self.inner.socket_type {
            SocketType::Requester => Box::new(Requester::new(io_loop, mailbox, self.inner.options)),
            SocketType::Pusher => Box::new(Pusher::new(io_loop, mailbox, self.inner.options)),
            SocketType::Replier | SocketType::Puller => unreachable!("can_connect checked"),
        };
        self.open(pattern)?;

        {
            let mut guard = self.inner.pattern.lock();
            let pattern = guard.as_mut().expect("pattern was just installed");
            pattern.connect(addr)?;
        }

        // Block until the connect outcome arrives.
        if let Err(e) = self.drain_commands(None) {
            return Err(match e.errno() {
                Some(errno) => CapstanError::Connection(errno),
                None => e,
            });
        }
        self.check_open()
    }

    /// Send one message, blocking while backpressure holds it off.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_inner(data.into(), true)
    }

    /// Non-blocking send; fails with `Again` instead of waiting.
    pub fn try_send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_inner(data.into(), false)
    }

    /// Receive one message, blocking until one is available.
    pub fn recv(&self) -> Result<Bytes> {
        self.recv_inner(true)
    }

    /// Non-blocking receive; fails with `Again` when nothing is ready.
    pub fn try_recv(&self) -> Result<Bytes> {
        self.recv_inner(false)
    }

    /// Report which of the requested readiness bits currently hold.
    #[must_use]
    pub fn poll(&self, mask: EventSet) -> EventSet {
        let mut guard = self.inner.pattern.lock();
        let Some(pattern) = guard.as_mut() else {
            return EventSet::NONE;
        };
        let mut ready = EventSet::NONE;
        if mask.is_readable() && pattern.recv_available() {
            ready |= EventSet::READABLE;
        }
        if mask.is_writable() && pattern.send_available() {
            ready |= EventSet::WRITABLE;
        }
        ready
    }

    /// The bound address, or the dialer's local address once connected.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        if self.inner.state.lock().state != State::Open {
            return Err(CapstanError::ConnectionClosed);
        }
        self.inner
            .pattern
            .lock()
            .as_ref()
            .and_then(|p| p.local_addr())
            .ok_or(CapstanError::InconsistentState(
                "local address not available",
            ))
    }

    /// Start closing. The engines drain their send pipes, and the
    /// reaper thread carries the teardown to completion.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.state != State::Open {
                return Err(CapstanError::ConnectionClosed);
            }
            state.state = State::Closing;
        }
        {
            let mut guard = self.inner.pattern.lock();
            if let Some(pattern) = guard.as_mut() {
                pattern.close();
            }
        }
        let socket = self.clone();
        self.inner.context.reaper().register(
            self.inner.mailbox.waker_fd(),
            EventSet::READABLE,
            move |_fd, _events| {
                // Late engine errors must not strand the teardown; keep
                // draining until the mailbox runs dry or finalizes.
                loop {
                    match socket.drain_commands(Some(Duration::ZERO)) {
                        Ok(()) => return Ok(()),
                        Err(e) => tracing::debug!("engine error while closing: {e}"),
                    }
                }
            },
        )?;
        Ok(())
    }

    fn open(&self, pattern: Box<dyn Pattern>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.state != State::Idle {
            return Err(CapstanError::ConnectionInUse);
        }
        *self.inner.pattern.lock() = Some(pattern);
        state.state = State::Open;
        Ok(())
    }

    fn check_idle(&self) -> Result<()> {
        match self.inner.state.lock().state {
            State::Idle => Ok(()),
            State::Open => Err(CapstanError::ConnectionInUse),
            State::Closing | State::Closed => Err(CapstanError::ConnectionClosed),
        }
    }

    /// Verify the socket is open, surfacing a remembered engine error
    /// exactly once.
    fn check_open(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.state == State::Open {
            return Ok(());
        }
        Err(state
            .pending_error
            .take()
            .unwrap_or(CapstanError::ConnectionClosed))
    }

    fn send_inner(&self, data: Bytes, blocking: bool) -> Result<()> {
        self.check_open()?;
        self.drain_commands(Some(Duration::ZERO))?;
        self.check_open()?;

        match self.pattern_send(data.clone()) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_again() && blocking => {}
            Err(e) => return Err(e),
        }

        loop {
            self.drain_commands(None)?;
            self.check_open()?;
            match self.pattern_send(data.clone()) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_again() => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn recv_inner(&self, blocking: bool) -> Result<Bytes> {
        self.check_open()?;
        self.drain_commands(Some(Duration::ZERO))?;
        self.check_open()?;

        match self.pattern_recv() {
            Ok(data) => return Ok(data),
            Err(e) if e.is_again() && blocking => {}
            Err(e) => return Err(e),
        }

        loop {
            self.drain_commands(None)?;
            self.check_open()?;
            match self.pattern_recv() {
                Ok(data) => return Ok(data),
                Err(e) if e.is_again() => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn pattern_send(&self, data: Bytes) -> Result<()> {
        let mut guard = self.inner.pattern.lock();
        let Some(pattern) = guard.as_mut() else {
            return Err(CapstanError::ConnectionClosed);
        };
        pattern.send(data)
    }

    fn pattern_recv(&self) -> Result<Bytes> {
        let mut guard = self.inner.pattern.lock();
        let Some(pattern) = guard.as_mut() else {
            return Err(CapstanError::ConnectionClosed);
        };
        pattern.recv()
    }

    /// Process mailbox commands: block up to `timeout` for the first,
    /// then keep draining without waiting until the mailbox runs dry or
    /// FINALIZE ends the socket.
    fn drain_commands(&self, timeout: Option<Duration>) -> Result<()> {
        let mut timeout = timeout;
        loop {
            let command = match self.inner.mailbox.recv(timeout) {
                Ok(command) => command,
                Err(e) if e.is_again() => return Ok(()),
                Err(e) => return Err(e),
            };
            if self.dispatch(command)?.is_break() {
                return Ok(());
            }
            timeout = Some(Duration::ZERO);
        }
    }

    fn dispatch(&self, command: Command) -> Result<ControlFlow<()>> {
        match command {
            Command::ActivateSend { engine } => {
                if let Some(pattern) = self.inner.pattern.lock().as_mut() {
                    pattern.activate_send(engine);
                }
            }
            Command::ActivateRecv { engine } => {
                if let Some(pattern) = self.inner.pattern.lock().as_mut() {
                    pattern.activate_recv(engine);
                }
            }
            Command::ConnectSuccess { local_addr } => {
                if let Some(pattern) = self.inner.pattern.lock().as_mut() {
                    pattern.connected(local_addr);
                }
            }
            Command::Error { engine, error } => {
                if let Some(pattern) = self.inner.pattern.lock().as_mut() {
                    pattern.connection_close(engine);
                }
                if !error.is_reset() {
                    return Err(error);
                }
                // Losing the only engine closes a dialing socket; hold
                // the wrapped error for the caller blocked on it. A
                // listener just drops the peer and keeps serving.
                if self.inner.socket_type.can_connect() {
                    self.inner.state.lock().pending_error = Some(error);
                }
            }
            Command::Closed { engine } => {
                if let Some(pattern) = self.inner.pattern.lock().as_mut() {
                    pattern.connection_close(engine);
                }
            }
            Command::Finalize => {
                if let Some(pattern) = self.inner.pattern.lock().as_mut() {
                    pattern.connection_finalize();
                }
                self.finalize();
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Release the mailbox and whatever the pattern still holds. The
    /// socket is closed for good afterwards.
    fn finalize(&self) {
        *self.inner.pattern.lock() = None;
        self.inner
            .context
            .reaper()
            .unregister(self.inner.mailbox.waker_fd());
        self.inner.mailbox.close();
        self.inner.state.lock().state = State::Closed;
    }
}
