//! Process-wide runtime context.
//!
//! Owns the two reactor threads: the io-loop, where streams and
//! engines live, and the reaper, which drains the mailboxes of closing
//! sockets. Startup is synchronous; `stop` gives each thread a five
//! second grace period and abandons it with a warning otherwise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, warn};

use capstan_core::{CapstanError, IoLoop, Result, SocketOptions};
use capstan_wire::SocketType;

use crate::socket::Socket;

const STOP_GRACE: Duration = Duration::from_secs(5);

struct ReactorThread {
    io_loop: IoLoop,
    handle: Mutex<Option<JoinHandle<()>>>,
    done: flume::Receiver<()>,
}

struct ContextInner {
    io_loop: ReactorThread,
    reaper: ReactorThread,
    stopped: AtomicBool,
}

/// The runtime all sockets share. Cloning yields another handle; the
/// threads stop when `stop` is called or the last handle drops.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Start both reactor threads, returning once they are live.
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(ContextInner {
                io_loop: spawn_reactor("capstan-io")?,
                reaper: spawn_reactor("capstan-reaper")?,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Create a socket of the given type with default options.
    pub fn socket(&self, socket_type: SocketType) -> Result<Socket> {
        self.socket_with(socket_type, SocketOptions::default())
    }

    /// Create a socket with explicit options (pipe watermarks).
    pub fn socket_with(&self, socket_type: SocketType, options: SocketOptions) -> Result<Socket> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(CapstanError::InconsistentState("context is stopped"));
        }
        Socket::new(self.clone(), socket_type, options)
    }

    /// Run `callback` on the io-loop thread.
    pub fn run_in_background(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.io_loop.io_loop.next_tick(callback);
    }

    #[must_use]
    pub fn io_loop(&self) -> &IoLoop {
        &self.inner.io_loop.io_loop
    }

    #[must_use]
    pub fn reaper(&self) -> &IoLoop {
        &self.inner.reaper.io_loop
    }

    /// Stop both reactors and join their threads. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

impl ContextInner {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        stop_reactor("io-loop", &self.io_loop);
        stop_reactor("reaper", &self.reaper);
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_reactor(name: &str) -> Result<ReactorThread> {
    let io_loop = IoLoop::new()?;
    let (init_tx, init_rx) = flume::bounded(1);
    let (done_tx, done_rx) = flume::bounded(1);

    let thread_loop = io_loop.clone();
    let handle = thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            let _ = init_tx.send(());
            if let Err(e) = thread_loop.run() {
                error!("reactor thread exited with error: {e}");
            }
            let _ = done_tx.send(());
        })
        .map_err(CapstanError::from)?;

    init_rx.recv().map_err(|_| {
        CapstanError::InconsistentState("reactor thread exited during startup")
    })?;

    Ok(ReactorThread {
        io_loop,
        handle: Mutex::new(Some(handle)),
        done: done_rx,
    })
}

fn stop_reactor(name: &str, reactor: &ReactorThread) {
    let stopper = reactor.io_loop.clone();
    reactor.io_loop.next_tick(move || stopper.stop());

    match reactor.done.recv_timeout(STOP_GRACE) {
        Ok(()) => {
            if let Some(handle) = reactor.handle.lock().take() {
                let _ = handle.join();
            }
        }
        Err(_) => warn!("{name} thread failed to stop within {STOP_GRACE:?}"),
    }
}
