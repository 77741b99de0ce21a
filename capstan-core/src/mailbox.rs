//! Cross-thread command mailbox, as in libzmq: a lock-protected pipe
//! plus a waker fd. Any thread may send; one thread receives. The read
//! side can also be registered with a reactor through `waker_fd`.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{CapstanError, Result};
use crate::pipe::Pipe;
use crate::waker::Waker;

/// Identity of a stream engine, assigned from a process-wide monotonic
/// counter. Used as the routing key on every mailbox command.
pub type EngineId = u64;

/// Command envelope exchanged between the reactor side and the socket
/// facade.
#[derive(Debug)]
pub enum Command {
    /// The engine drained past its low watermark; a parked producer may
    /// resume writing.
    ActivateSend { engine: EngineId },
    /// The engine's receive pipe became readable.
    ActivateRecv { engine: EngineId },
    /// An outbound connect completed, with the local address the OS
    /// assigned to the dialer.
    ConnectSuccess { local_addr: Option<SocketAddr> },
    /// The engine failed; reset-family errors close it quietly, anything
    /// else re-raises on the user thread.
    Error {
        engine: EngineId,
        error: CapstanError,
    },
    /// The engine finished a requested close.
    Closed { engine: EngineId },
    /// All engine resources are released; the socket may finish closing.
    Finalize,
}

pub struct Mailbox {
    pipe: Pipe<Command>,
    waker: Waker,
    send_lock: Mutex<()>,
    // Consumer-side state: set after a wakeup, cleared when the pipe
    // runs dry, so one signal covers a whole batch of commands.
    active: AtomicBool,
}

impl Mailbox {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pipe: Pipe::unbounded(),
            waker: Waker::new()?,
            send_lock: Mutex::new(()),
            active: AtomicBool::new(false),
        })
    }

    /// Enqueue a command, signaling the waker on the empty-to-readable
    /// transition.
    pub fn send(&self, command: Command) -> Result<()> {
        let _guard = self.send_lock.lock();
        if !self.pipe.force_write(command) {
            self.waker.wake()?;
        }
        Ok(())
    }

    /// Dequeue the next command, blocking up to `timeout` (`None` waits
    /// indefinitely, `Some(0)` returns immediately). Fails with `Again`
    /// on timeout.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Command> {
        if self.active.load(Ordering::Relaxed) {
            match self.pipe.read() {
                Ok((command, _)) => return Ok(command),
                Err(_) => self.active.store(false, Ordering::Relaxed),
            }
        }

        self.waker.wait(timeout)?;
        self.waker.deplete()?;
        self.active.store(true, Ordering::Relaxed);

        match self.pipe.read() {
            Ok((command, _)) => Ok(command),
            Err(_) => Err(CapstanError::InconsistentState(
                "mailbox pipe empty after waker signal",
            )),
        }
    }

    /// The fd an external reactor can poll for readability.
    #[must_use]
    pub fn waker_fd(&self) -> RawFd {
        self.waker.waker_fd()
    }

    pub fn close(&self) {
        self.waker.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn commands_arrive_in_order() {
        let mailbox = Mailbox::new().unwrap();
        mailbox.send(Command::ActivateSend { engine: 1 }).unwrap();
        mailbox.send(Command::ActivateRecv { engine: 2 }).unwrap();

        assert!(matches!(
            mailbox.recv(Some(Duration::from_secs(1))).unwrap(),
            Command::ActivateSend { engine: 1 }
        ));
        assert!(matches!(
            mailbox.recv(Some(Duration::from_secs(1))).unwrap(),
            Command::ActivateRecv { engine: 2 }
        ));
        assert!(mailbox
            .recv(Some(Duration::ZERO))
            .unwrap_err()
            .is_again());
    }

    #[test]
    fn send_unblocks_remote_recv_promptly() {
        let mailbox = Arc::new(Mailbox::new().unwrap());
        let sender = Arc::clone(&mailbox);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sender.send(Command::Finalize).unwrap();
        });

        let start = Instant::now();
        let command = mailbox.recv(None).unwrap();
        assert!(matches!(command, Command::Finalize));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn one_signal_covers_a_batch() {
        let mailbox = Mailbox::new().unwrap();
        for engine in 0..10 {
            mailbox.send(Command::Closed { engine }).unwrap();
        }
        for engine in 0..10 {
            match mailbox.recv(Some(Duration::from_secs(1))).unwrap() {
                Command::Closed { engine: got } => assert_eq!(got, engine),
                other => panic!("unexpected command {other:?}"),
            }
        }
        assert!(mailbox
            .recv(Some(Duration::ZERO))
            .unwrap_err()
            .is_again());
    }
}
