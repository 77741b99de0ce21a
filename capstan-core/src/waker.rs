//! Self-pipe waker.
//!
//! A socket pair used as a counting semaphore over bytes: `wake` writes
//! one byte, `deplete` consumes one, and the read end can be handed to
//! any poller (the reactor registers it, `wait` uses a private one).

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{CapstanError, Result};
use crate::event::EventSet;
use crate::poller::{self, Poller};

pub struct Waker {
    reader: UnixStream,
    writer: Mutex<UnixStream>,
    closed: AtomicBool,
    // Built on first wait; only the consumer thread ever waits.
    wait_poller: Mutex<Option<Poller>>,
}

impl Waker {
    pub fn new() -> Result<Self> {
        let (reader, writer) = UnixStream::pair().map_err(CapstanError::from)?;
        reader.set_nonblocking(true).map_err(CapstanError::from)?;
        writer.set_nonblocking(true).map_err(CapstanError::from)?;
        Ok(Self {
            reader,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            wait_poller: Mutex::new(None),
        })
    }

    /// The fd an external poller can watch for readability.
    #[must_use]
    pub fn waker_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Signal the read side. A full pipe already carries a pending
    /// signal, so `WouldBlock` counts as success.
    pub fn wake(&self) -> Result<()> {
        let writer = self.writer.lock();
        if self.closed.load(Ordering::Relaxed) {
            return Ok(());
        }
        loop {
            match (&*writer).write(b"w") {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if self.closed.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Consume one pending signal, failing with `Again` when none is
    /// buffered.
    pub fn deplete(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(CapstanError::Again);
        }
        let mut byte = [0u8; 1];
        match (&self.reader).read(&mut byte) {
            Ok(0) => Err(CapstanError::Again),
            Ok(_) => Ok(()),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Err(CapstanError::Again)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the read side is signaled or `timeout` elapses
    /// (`Again` on timeout). `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(CapstanError::ConnectionClosed);
        }

        let mut guard = self.wait_poller.lock();
        if guard.is_none() {
            let poller = Poller::new().map_err(CapstanError::from)?;
            let registry = poller.handle().map_err(CapstanError::from)?;
            poller::register(&registry, self.waker_fd(), EventSet::READABLE)?;
            *guard = Some(poller);
        }
        let poller = guard.as_mut().expect("poller was just installed");

        let start = Instant::now();
        let mut remaining = timeout;
        loop {
            match poller.poll(remaining) {
                Ok(()) => {
                    if poller.events().next().is_some() {
                        return Ok(());
                    }
                    return Err(CapstanError::Again);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if let Some(total) = timeout {
                        let elapsed = start.elapsed();
                        if elapsed >= total {
                            return Err(CapstanError::Again);
                        }
                        remaining = Some(total - elapsed);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close both ends. Safe to call from any thread; pending and future
    /// `wake`/`deplete` calls become no-ops.
    pub fn close(&self) {
        let writer = self.writer.lock();
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = writer.shutdown(Shutdown::Both);
        let _ = self.reader.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wake_then_wait_and_deplete() {
        let waker = Waker::new().unwrap();
        waker.wake().unwrap();
        waker.wait(Some(Duration::from_secs(1))).unwrap();
        waker.deplete().unwrap();
        assert!(waker.deplete().unwrap_err().is_again());
    }

    #[test]
    fn wait_times_out_when_unsignaled() {
        let waker = Waker::new().unwrap();
        let err = waker.wait(Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_again());
    }

    #[test]
    fn wake_from_other_thread_unblocks_wait() {
        let waker = Arc::new(Waker::new().unwrap());
        let remote = Arc::clone(&waker);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.wake().unwrap();
        });
        waker.wait(None).unwrap();
        waker.deplete().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn close_is_idempotent_and_quiet() {
        let waker = Waker::new().unwrap();
        waker.close();
        waker.close();
        waker.wake().unwrap();
        assert!(waker.deplete().unwrap_err().is_again());
    }
}
