//! Non-blocking TCP byte stream driven by the reactor.
//!
//! Every operation returns a [`Promise`]; completion happens on the
//! reactor thread as readiness events arrive. One read may be pending
//! at a time. Writes are pipelined: each call enqueues its chunks plus
//! a completion watermark, and the promise resolves once the drain has
//! passed that watermark.
//!
//! The stream keeps READABLE armed for as long as it is open. The
//! poller is edge-triggered, so every read event drains the socket
//! until `WouldBlock`; bytes the current read target does not need stay
//! in the segmented buffer. WRITABLE is armed only while the write
//! queue is non-empty or a connect is in flight.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::BufferReader;
use crate::error::{CapstanError, Result};
use crate::event::EventSet;
use crate::io_loop::IoLoop;
use crate::promise::Promise;

/// Largest single read from the socket and largest write chunk.
pub const MAX_BLOCK_SIZE: usize = 128 * 1024;

enum ReadTarget {
    Length(usize),
    Delimiter(Bytes),
}

/// Completions to fire after the stream lock is released, so promise
/// callbacks never run under it.
enum Outcome {
    Read(Promise<Bytes>, Result<Bytes>),
    Write(Promise<()>, Result<()>),
    Connect(Promise<()>, Result<()>),
}

fn fire(outcomes: Vec<Outcome>) {
    for outcome in outcomes {
        match outcome {
            Outcome::Read(promise, result) => promise.complete(result),
            Outcome::Write(promise, result) => promise.complete(result),
            Outcome::Connect(promise, result) => promise.complete(result),
        }
    }
}

#[derive(Clone)]
pub struct SocketStream {
    inner: Arc<Mutex<StreamInner>>,
}

struct StreamInner {
    io: Option<TcpStream>,
    io_loop: IoLoop,
    event_mask: EventSet,
    reader: BufferReader,
    read_target: Option<ReadTarget>,
    read_promise: Option<Promise<Bytes>>,
    write_queue: VecDeque<Bytes>,
    enqueued: u64,
    written: u64,
    write_waiters: VecDeque<(u64, Promise<()>)>,
    connect_promise: Option<Promise<()>>,
    connecting: bool,
    local_addr: Option<SocketAddr>,
    error: Option<Arc<io::Error>>,
    stopping: bool,
    stopped: bool,
    scratch: Vec<u8>,
}

impl SocketStream {
    /// A detached stream; `connect` attaches the socket later.
    #[must_use]
    pub fn new(io_loop: IoLoop) -> Self {
        Self::build(io_loop, None)
    }

    /// Wrap an accepted connection.
    #[must_use]
    pub fn from_accepted(io_loop: IoLoop, stream: TcpStream) -> Self {
        Self::build(io_loop, Some(stream))
    }

    fn build(io_loop: IoLoop, io: Option<TcpStream>) -> Self {
        let local_addr = io.as_ref().and_then(|s| s.local_addr().ok());
        Self {
            inner: Arc::new(Mutex::new(StreamInner {
                io,
                io_loop,
                event_mask: EventSet::NONE,
                reader: BufferReader::new(),
                read_target: None,
                read_promise: None,
                write_queue: VecDeque::new(),
                enqueued: 0,
                written: 0,
                write_waiters: VecDeque::new(),
                connect_promise: None,
                connecting: false,
                local_addr,
                error: None,
                stopping: false,
                stopped: false,
                scratch: vec![0u8; MAX_BLOCK_SIZE],
            })),
        }
    }

    /// Begin a non-blocking connect. The promise resolves once the OS
    /// reports the socket writable with no pending error.
    pub fn connect(&self, addr: SocketAddr) -> Promise<()> {
        let mut outcomes = Vec::new();
        let promise;
        {
            let mut inner = self.inner.lock();
            if inner.stopping {
                return Promise::failed(CapstanError::Stream(inner.error.clone()));
            }
            if inner.io.is_some() || inner.connecting {
                return Promise::failed(CapstanError::InconsistentState(
                    "stream is already connected",
                ));
            }
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    inner.io = Some(stream);
                    inner.connecting = true;
                    promise = Promise::new();
                    inner.connect_promise = Some(promise.clone());
                    if let Err(e) = self.arm(&mut inner, EventSet::WRITABLE) {
                        Self::shut_down(&mut inner, Some(into_io(e)), &mut outcomes);
                    }
                }
                Err(e) => {
                    Self::shut_down(&mut inner, Some(e), &mut outcomes);
                    promise = Promise::failed(CapstanError::Stream(inner.error.clone()));
                }
            }
        }
        fire(outcomes);
        promise
    }

    /// Read exactly `n` bytes.
    pub fn read_with_length(&self, n: usize) -> Promise<Bytes> {
        self.start_read(ReadTarget::Length(n))
    }

    /// Read up to and including `delimiter`.
    pub fn read_with_delimiter(&self, delimiter: impl Into<Bytes>) -> Promise<Bytes> {
        self.start_read(ReadTarget::Delimiter(delimiter.into()))
    }

    fn start_read(&self, target: ReadTarget) -> Promise<Bytes> {
        let mut outcomes = Vec::new();
        let promise;
        {
            let mut inner = self.inner.lock();
            if inner.read_promise.is_some() {
                return Promise::failed(CapstanError::InconsistentState(
                    "stream is already reading",
                ));
            }
            if inner.stopping {
                return Promise::failed(CapstanError::Stream(inner.error.clone()));
            }
            if inner.io.is_none() {
                return Promise::failed(CapstanError::InconsistentState(
                    "stream is not connected",
                ));
            }
            promise = Promise::new();
            inner.read_target = Some(target);
            inner.read_promise = Some(promise.clone());

            // Serve from buffered data when possible.
            Self::satisfy_read(&mut inner, &mut outcomes);

            if let Err(e) = self.arm(&mut inner, EventSet::READABLE) {
                Self::shut_down(&mut inner, Some(into_io(e)), &mut outcomes);
            }
        }
        fire(outcomes);
        promise
    }

    /// Queue `data` for sending. Payloads larger than
    /// [`MAX_BLOCK_SIZE`] are split on enqueue.
    pub fn write(&self, data: Bytes) -> Promise<()> {
        let mut outcomes = Vec::new();
        let promise;
        {
            let mut inner = self.inner.lock();
            if inner.stopping {
                return Promise::failed(CapstanError::Stream(inner.error.clone()));
            }
            if inner.io.is_none() {
                return Promise::failed(CapstanError::InconsistentState(
                    "stream is not connected",
                ));
            }

            let total = data.len() as u64;
            let mut data = data;
            while data.len() > MAX_BLOCK_SIZE {
                let chunk = data.split_to(MAX_BLOCK_SIZE);
                inner.write_queue.push_back(chunk);
            }
            if !data.is_empty() {
                inner.write_queue.push_back(data);
            }
            inner.enqueued += total;

            promise = Promise::new();
            let watermark = inner.enqueued;
            inner.write_waiters.push_back((watermark, promise.clone()));

            match Self::flush_write(&mut inner, &mut outcomes) {
                Ok(()) => {
                    if !inner.write_queue.is_empty() {
                        if let Err(e) = self.arm(&mut inner, EventSet::WRITABLE) {
                            Self::shut_down(&mut inner, Some(into_io(e)), &mut outcomes);
                        }
                    }
                }
                Err(e) => Self::shut_down(&mut inner, Some(e), &mut outcomes),
            }
        }
        fire(outcomes);
        promise
    }

    /// Close the stream, failing every pending promise. Idempotent, and
    /// safe to call from inside an I/O completion.
    pub fn close(&self) {
        let mut outcomes = Vec::new();
        {
            let mut inner = self.inner.lock();
            Self::shut_down(&mut inner, None, &mut outcomes);
        }
        fire(outcomes);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().stopping
    }

    /// The local address, available once connected or accepted.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.inner.lock();
        inner
            .local_addr
            .or_else(|| inner.io.as_ref().and_then(|io| io.local_addr().ok()))
    }

    fn handle_io(&self, _fd: RawFd, events: EventSet) -> Result<()> {
        let mut outcomes = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.stopped || inner.io.is_none() {
                return Ok(());
            }
            match Self::dispatch_events(&mut inner, events, &mut outcomes) {
                Err(e) => Self::shut_down(&mut inner, Some(e), &mut outcomes),
                Ok(()) => {
                    if !inner.stopping {
                        if let Err(e) = Self::refresh_mask(&mut inner) {
                            Self::shut_down(&mut inner, Some(into_io(e)), &mut outcomes);
                        }
                    }
                }
            }
        }
        fire(outcomes);
        Ok(())
    }

    fn dispatch_events(
        inner: &mut StreamInner,
        events: EventSet,
        outcomes: &mut Vec<Outcome>,
    ) -> io::Result<()> {
        if inner.connecting && (events.is_writable() || events.is_error()) {
            Self::finish_connect(inner, outcomes)?;
        }
        if events.is_readable() {
            Self::drain_read(inner, outcomes)?;
        }
        if events.is_writable() && !inner.connecting {
            Self::flush_write(inner, outcomes)?;
        }
        if events.is_error() {
            return Err(Self::socket_error(inner));
        }
        Ok(())
    }

    fn finish_connect(inner: &mut StreamInner, outcomes: &mut Vec<Outcome>) -> io::Result<()> {
        let io = inner.io.as_ref().expect("dispatch checked io");
        if let Some(e) = io.take_error()? {
            return Err(e);
        }
        match io.peer_addr() {
            Ok(_) => {
                inner.connecting = false;
                inner.local_addr = io.local_addr().ok();
                if let Some(promise) = inner.connect_promise.take() {
                    outcomes.push(Outcome::Connect(promise, Ok(())));
                }
                Ok(())
            }
            // Writable can fire before the handshake settles; stay armed.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn drain_read(inner: &mut StreamInner, outcomes: &mut Vec<Outcome>) -> io::Result<()> {
        loop {
            let inner_ref = &mut *inner;
            let io = inner_ref.io.as_mut().expect("dispatch checked io");
            match io.read(&mut inner_ref.scratch) {
                Ok(0) => {
                    return Err(io::Error::from(io::ErrorKind::ConnectionReset));
                }
                Ok(n) => {
                    let block = Bytes::copy_from_slice(&inner_ref.scratch[..n]);
                    inner_ref.reader.push(block);
                    Self::satisfy_read(inner, outcomes);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn satisfy_read(inner: &mut StreamInner, outcomes: &mut Vec<Outcome>) {
        if inner.read_promise.is_none() {
            return;
        }
        let inner_ref = &mut *inner;
        let popped = match &inner_ref.read_target {
            Some(ReadTarget::Length(n)) => inner_ref.reader.read_until_length(*n),
            Some(ReadTarget::Delimiter(d)) => inner_ref.reader.read_until_delimiter(d),
            None => None,
        };
        if let Some(bytes) = popped {
            inner.read_target = None;
            if let Some(promise) = inner.read_promise.take() {
                outcomes.push(Outcome::Read(promise, Ok(bytes)));
            }
        }
    }

    fn flush_write(inner: &mut StreamInner, outcomes: &mut Vec<Outcome>) -> io::Result<()> {
        loop {
            let inner_ref = &mut *inner;
            let Some(front) = inner_ref.write_queue.front_mut() else {
                break;
            };
            let io = inner_ref.io.as_mut().expect("caller checked io");
            match io.write(&front[..]) {
                Ok(n) => {
                    inner_ref.written += n as u64;
                    if n == front.len() {
                        inner_ref.write_queue.pop_front();
                    } else {
                        front.advance(n);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        while let Some((watermark, _)) = inner.write_waiters.front() {
            if *watermark <= inner.written {
                let (_, promise) = inner.write_waiters.pop_front().expect("front exists");
                outcomes.push(Outcome::Write(promise, Ok(())));
            } else {
                break;
            }
        }
        Ok(())
    }

    fn refresh_mask(inner: &mut StreamInner) -> Result<()> {
        let mut mask = EventSet::READABLE | EventSet::ERROR;
        if !inner.write_queue.is_empty() || inner.connecting {
            mask |= EventSet::WRITABLE;
        }
        if mask != inner.event_mask {
            inner.event_mask = mask;
            let fd = inner.io.as_ref().expect("caller checked io").as_raw_fd();
            inner.io_loop.modify(fd, mask)?;
        }
        Ok(())
    }

    fn arm(&self, inner: &mut StreamInner, add: EventSet) -> Result<()> {
        if inner.stopped {
            return Ok(());
        }
        let prev = inner.event_mask;
        let mask = prev | add | EventSet::ERROR;
        if mask == prev {
            return Ok(());
        }
        inner.event_mask = mask;
        let fd = inner.io.as_ref().expect("caller checked io").as_raw_fd();
        if prev == EventSet::NONE {
            let stream = self.clone();
            inner
                .io_loop
                .register(fd, mask, move |fd, events| stream.handle_io(fd, events))
        } else {
            inner.io_loop.modify(fd, mask)
        }
    }

    fn socket_error(inner: &mut StreamInner) -> io::Error {
        let io = inner.io.as_ref().expect("dispatch checked io");
        match io.take_error() {
            Ok(Some(e)) => e,
            Ok(None) => io::Error::other("error event without a socket error"),
            Err(e) => e,
        }
    }

    fn shut_down(inner: &mut StreamInner, cause: Option<io::Error>, outcomes: &mut Vec<Outcome>) {
        if let Some(cause) = cause {
            if inner.error.is_none() {
                inner.error = Some(Arc::new(cause));
            }
        }
        if inner.stopping {
            // Second close while completions are still in flight.
            Self::fail_all(inner, outcomes);
            return;
        }
        inner.stopping = true;
        if let Some(io) = inner.io.take() {
            inner.io_loop.unregister(io.as_raw_fd());
        }
        Self::fail_all(inner, outcomes);
    }

    fn fail_all(inner: &mut StreamInner, outcomes: &mut Vec<Outcome>) {
        if inner.stopped {
            return;
        }
        inner.stopped = true;
        if let Some(e) = &inner.error {
            debug!("closing stream with error: {e}");
        }
        let err = CapstanError::Stream(inner.error.clone());
        inner.connecting = false;
        if let Some(promise) = inner.connect_promise.take() {
            outcomes.push(Outcome::Connect(promise, Err(err.clone())));
        }
        inner.read_target = None;
        if let Some(promise) = inner.read_promise.take() {
            outcomes.push(Outcome::Read(promise, Err(err.clone())));
        }
        while let Some((_, promise)) = inner.write_waiters.pop_front() {
            outcomes.push(Outcome::Write(promise, Err(err.clone())));
        }
        inner.write_queue.clear();
        inner.event_mask = EventSet::NONE;
    }
}

fn into_io(e: CapstanError) -> io::Error {
    match e.io_source() {
        Some(source) => io::Error::new(source.kind(), e.to_string()),
        None => io::Error::other(e.to_string()),
    }
}
