//! The reactor.
//!
//! One `IoLoop` cooperatively multiplexes fd readiness, deferred
//! callbacks, timers and cooperative tasks on a single thread. The
//! struct itself is a cheap cloneable handle, so other threads can
//! enqueue work; an internal self-pipe waker makes an in-flight poll
//! return promptly whenever they do.
//!
//! Within one iteration: deferred callbacks run first in FIFO order,
//! then expired timers in deadline order (ties broken by creation
//! sequence), then fd events in poller order. Handler failures are
//! logged and never tear the loop down.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use mio::Registry;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{CapstanError, Result};
use crate::event::EventSet;
use crate::poller::{self, Poller};
use crate::promise::Promise;
use crate::task::TaskWaker;
use crate::waker::Waker;

/// Upper bound on one poll, so the loop revisits its queues at least
/// once a second even without a waker signal.
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

type FdHandler = Box<dyn FnMut(RawFd, EventSet) -> Result<()> + Send>;
type TimerCallback = Box<dyn FnOnce() -> Result<()> + Send>;
type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TimerSlot = Arc<Mutex<Option<TimerCallback>>>;

pub(crate) enum Runnable {
    Call(Box<dyn FnOnce() + Send>),
    Resume(u64),
}

/// Cancellation handle returned by [`IoLoop::set_timeout`]. Dropping
/// the handle does not cancel the timer.
pub struct TimeoutHandle {
    slot: TimerSlot,
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    slot: TimerSlot,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct LoopState {
    started: bool,
    running: bool,
    stopping: bool,
    pausing: bool,
    thread: Option<ThreadId>,
}

struct Shared {
    state: Mutex<LoopState>,
    queue: Mutex<Vec<Runnable>>,
    handlers: Mutex<HashMap<RawFd, Arc<Mutex<FdHandler>>>>,
    timers: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    timer_seq: AtomicU64,
    tasks: Mutex<HashMap<u64, TaskFuture>>,
    task_seq: AtomicU64,
    poller: Mutex<Option<Poller>>,
    registry: Registry,
    waker: Mutex<Option<Arc<Waker>>>,
}

#[derive(Clone)]
pub struct IoLoop {
    shared: Arc<Shared>,
}

impl IoLoop {
    pub fn new() -> Result<Self> {
        let poller = Poller::new().map_err(CapstanError::from)?;
        let registry = poller.handle().map_err(CapstanError::from)?;
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState {
                    started: false,
                    running: false,
                    stopping: false,
                    pausing: false,
                    thread: None,
                }),
                queue: Mutex::new(Vec::new()),
                handlers: Mutex::new(HashMap::new()),
                timers: Mutex::new(BinaryHeap::new()),
                timer_seq: AtomicU64::new(0),
                tasks: Mutex::new(HashMap::new()),
                task_seq: AtomicU64::new(0),
                poller: Mutex::new(Some(poller)),
                registry,
                waker: Mutex::new(None),
            }),
        })
    }

    /// Watch `fd` for the given readiness, dispatching events to
    /// `handler`. Re-registering an already-watched fd updates its
    /// interest. Callable from any thread.
    pub fn register(
        &self,
        fd: RawFd,
        set: EventSet,
        handler: impl FnMut(RawFd, EventSet) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.wake();
        let mut handlers = self.shared.handlers.lock();
        if handlers.contains_key(&fd) {
            poller::reregister(&self.shared.registry, fd, set)?;
        } else {
            poller::register(&self.shared.registry, fd, set)?;
        }
        handlers.insert(fd, Arc::new(Mutex::new(Box::new(handler) as FdHandler)));
        Ok(())
    }

    /// Change the interest of a watched fd; unknown fds are ignored.
    pub fn modify(&self, fd: RawFd, set: EventSet) -> Result<()> {
        self.wake();
        let handlers = self.shared.handlers.lock();
        if handlers.contains_key(&fd) {
            poller::reregister(&self.shared.registry, fd, set)
        } else {
            Ok(())
        }
    }

    /// Stop watching `fd` and drop its handler.
    pub fn unregister(&self, fd: RawFd) {
        self.wake();
        let mut handlers = self.shared.handlers.lock();
        poller::deregister(&self.shared.registry, fd);
        handlers.remove(&fd);
    }

    /// Enqueue a zero-delay callback for the next iteration. FIFO with
    /// respect to other `next_tick` calls from the same thread.
    pub fn next_tick(&self, callback: impl FnOnce() + Send + 'static) {
        self.enqueue(Runnable::Call(Box::new(callback)));
    }

    /// Schedule `callback` after `delay`. The returned handle can be
    /// passed to [`IoLoop::clear_timeout`].
    pub fn set_timeout(
        &self,
        delay: Duration,
        callback: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> TimeoutHandle {
        let slot: TimerSlot = Arc::new(Mutex::new(Some(Box::new(callback) as TimerCallback)));
        let entry = TimerEntry {
            at: Instant::now() + delay,
            seq: self.shared.timer_seq.fetch_add(1, Ordering::Relaxed),
            slot: Arc::clone(&slot),
        };
        self.shared.timers.lock().push(Reverse(entry));
        if !self.on_loop_thread() {
            self.wake();
        }
        TimeoutHandle { slot }
    }

    /// Cancel a scheduled timer. The heap entry is removed lazily.
    pub fn clear_timeout(&self, handle: &TimeoutHandle) {
        handle.slot.lock().take();
    }

    /// Run `callback(result)` on the loop thread once `promise`
    /// completes, regardless of which thread completes it.
    pub fn add_promise<T: Clone + Send + 'static>(
        &self,
        promise: &Promise<T>,
        callback: impl FnOnce(Result<T>) + Send + 'static,
    ) {
        let lp = self.clone();
        promise.add_done_callback(move |result| lp.next_tick(move || callback(result)));
    }

    /// Hand a cooperative task to the loop. The task is polled on the
    /// loop thread; its waker may fire from anywhere.
    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        let id = self.shared.task_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.tasks.lock().insert(id, Box::pin(future));
        self.enqueue(Runnable::Resume(id));
    }

    /// Spawn a fallible task and observe its outcome through a promise.
    pub fn spawn_promise<T: Clone + Send + 'static>(
        &self,
        future: impl Future<Output = Result<T>> + Send + 'static,
    ) -> Promise<T> {
        let promise = Promise::new();
        let completion = promise.clone();
        self.spawn(async move {
            completion.complete(future.await);
        });
        promise
    }

    /// Drive the loop on the calling thread until `stop` or `pause`.
    pub fn run(&self) -> Result<()> {
        let needs_waker;
        {
            let mut state = self.shared.state.lock();
            if state.running {
                return Err(CapstanError::InconsistentState("reactor is already running"));
            }
            state.running = true;
            state.stopping = false;
            state.pausing = false;
            state.thread = Some(thread::current().id());
            needs_waker = !state.started;
            state.started = true;
        }

        let outcome = (|| {
            if needs_waker {
                self.init_waker()?;
            }
            let mut poller = self
                .shared
                .poller
                .lock()
                .take()
                .ok_or(CapstanError::InconsistentState("reactor poller is in use"))?;
            let result = self.turn(&mut poller);
            *self.shared.poller.lock() = Some(poller);
            result
        })();

        let mut state = self.shared.state.lock();
        state.running = false;
        state.thread = None;
        drop(state);
        outcome
    }

    /// Tear the loop down: close the internal waker, release every
    /// registration, drop queued callbacks, timers and tasks.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.started || state.stopping {
                return;
            }
            state.stopping = true;
            state.started = false;
        }

        self.shared.queue.lock().clear();

        let waker = self.shared.waker.lock().take();
        if let Some(waker) = waker {
            let _ = waker.wake();
            self.unregister(waker.waker_fd());
            waker.close();
        }

        let handlers = mem::take(&mut *self.shared.handlers.lock());
        for (&fd, _) in &handlers {
            poller::deregister(&self.shared.registry, fd);
        }
        drop(handlers);

        self.shared.timers.lock().clear();
        self.shared.tasks.lock().clear();
    }

    /// Suspend the loop after the current iteration without releasing
    /// registrations; a later `run` resumes it.
    pub fn pause(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running || state.pausing {
                return;
            }
            state.pausing = true;
        }
        self.wake();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub(crate) fn enqueue(&self, runnable: Runnable) {
        {
            let state = self.shared.state.lock();
            if state.stopping {
                return;
            }
        }
        self.shared.queue.lock().push(runnable);
        if !self.on_loop_thread() {
            self.wake();
        }
    }

    fn on_loop_thread(&self) -> bool {
        self.shared.state.lock().thread == Some(thread::current().id())
    }

    fn wake(&self) {
        let waker = self.shared.waker.lock().as_ref().map(Arc::clone);
        if let Some(waker) = waker {
            if let Err(e) = waker.wake() {
                debug!("reactor waker signal failed: {e}");
            }
        }
    }

    fn init_waker(&self) -> Result<()> {
        let waker = Arc::new(Waker::new()?);
        let drain = Arc::clone(&waker);
        self.register(waker.waker_fd(), EventSet::READABLE, move |_fd, _events| {
            while drain.deplete().is_ok() {}
            Ok(())
        })?;
        *self.shared.waker.lock() = Some(waker);
        Ok(())
    }

    fn turn(&self, poller: &mut Poller) -> Result<()> {
        loop {
            let batch = mem::take(&mut *self.shared.queue.lock());

            let now = Instant::now();
            let mut due = Vec::new();
            {
                let mut timers = self.shared.timers.lock();
                while let Some(Reverse(entry)) = timers.peek() {
                    if entry.slot.lock().is_none() {
                        timers.pop();
                    } else if entry.at <= now {
                        let Reverse(entry) = timers.pop().expect("peeked entry exists");
                        due.push(entry);
                    } else {
                        break;
                    }
                }
            }

            for runnable in batch {
                self.run_one(runnable);
            }

            for entry in due {
                // Taken before invocation, so a re-entrant clear_timeout
                // on the firing timer stays idempotent.
                let callback = entry.slot.lock().take();
                if let Some(callback) = callback {
                    if let Err(e) = callback() {
                        error!("timer callback failed: {e}");
                    }
                }
            }

            {
                let mut state = self.shared.state.lock();
                if state.stopping || state.pausing {
                    state.stopping = false;
                    state.pausing = false;
                    return Ok(());
                }
            }

            let timeout = if self.shared.queue.lock().is_empty() {
                let timers = self.shared.timers.lock();
                match timers.peek() {
                    Some(Reverse(entry)) => entry
                        .at
                        .saturating_duration_since(Instant::now())
                        .min(POLL_TIMEOUT),
                    None => POLL_TIMEOUT,
                }
            } else {
                Duration::ZERO
            };

            if let Err(e) = poller.poll(Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    debug!("poll interrupted by signal");
                    continue;
                }
                return Err(e.into());
            }

            for (fd, set) in poller.events() {
                let handler = self.shared.handlers.lock().get(&fd).map(Arc::clone);
                if let Some(handler) = handler {
                    let mut handler = handler.lock();
                    if let Err(e) = (handler)(fd, set) {
                        error!(fd, "I/O handler failed: {e}");
                    }
                }
            }
        }
    }

    fn run_one(&self, runnable: Runnable) {
        match runnable {
            Runnable::Call(callback) => callback(),
            Runnable::Resume(id) => self.poll_task(id),
        }
    }

    fn poll_task(&self, id: u64) {
        // The task leaves the table while polled; a completed task is
        // simply not reinserted, and stale wakes find nothing to do.
        let Some(mut future) = self.shared.tasks.lock().remove(&id) else {
            return;
        };
        let waker = TaskWaker::waker(self.clone(), id);
        let mut cx = TaskContext::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {}
            Poll::Pending => {
                self.shared.tasks.lock().insert(id, future);
            }
        }
    }
}
