//! Readiness polling behind a single narrow interface.
//!
//! Backend selection (epoll on Linux, kqueue on the BSDs) happens inside
//! mio at compile time; nothing above this module depends on which
//! backend is in use. Descriptors are registered edge-triggered, so
//! consumers must drain until `WouldBlock` on every event.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::error::{CapstanError, Result};
use crate::event::EventSet;

const EVENT_CAPACITY: usize = 1024;

/// One readiness poller instance.
///
/// The reactor owns one; every [`crate::waker::Waker`] lazily creates a
/// private one for its blocking `wait`.
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
        })
    }

    /// A cloned handle for (re-/de-)registering descriptors, usable from
    /// any thread and while a poll is in flight.
    pub fn handle(&self) -> io::Result<Registry> {
        self.poll.registry().try_clone()
    }

    /// Wait for events, filling the internal buffer.
    ///
    /// `None` blocks indefinitely. EINTR is surfaced to the caller.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)
    }

    /// Events gathered by the last `poll`, as `(fd, readiness)` pairs.
    pub fn events(&self) -> impl Iterator<Item = (RawFd, EventSet)> + '_ {
        self.events.iter().map(|event| {
            let mut set = EventSet::NONE;
            if event.is_readable() || event.is_read_closed() {
                set |= EventSet::READABLE;
            }
            if event.is_writable() || event.is_write_closed() {
                set |= EventSet::WRITABLE;
            }
            if event.is_error() {
                set |= EventSet::ERROR;
            }
            (event.token().0 as RawFd, set)
        })
    }
}

/// Register `fd` with the given interest, keyed by its own number.
pub fn register(registry: &Registry, fd: RawFd, set: EventSet) -> Result<()> {
    registry
        .register(&mut SourceFd(&fd), Token(fd as usize), interest(set)?)
        .map_err(CapstanError::from)
}

pub fn reregister(registry: &Registry, fd: RawFd, set: EventSet) -> Result<()> {
    registry
        .reregister(&mut SourceFd(&fd), Token(fd as usize), interest(set)?)
        .map_err(CapstanError::from)
}

/// Remove `fd` from the poller. Failures are ignored: a descriptor that
/// induced its own close is already stale and reports EBADF here.
pub fn deregister(registry: &Registry, fd: RawFd) {
    let _ = registry.deregister(&mut SourceFd(&fd));
}

fn interest(set: EventSet) -> Result<Interest> {
    match (set.is_readable(), set.is_writable()) {
        (true, true) => Ok(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Ok(Interest::READABLE),
        (false, true) => Ok(Interest::WRITABLE),
        (false, false) => Err(CapstanError::InconsistentState(
            "registration requires a readable or writable interest",
        )),
    }
}
