//! Bounded in-memory FIFO with watermark backpressure.
//!
//! One producer and one consumer, on different threads, decoupled by an
//! internal lock. The high watermark caps the queue; the derived low
//! watermark paces the resume signal so producers wake up roughly once
//! per HWM/2 drained messages instead of once per message.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::{CapstanError, Result};

pub struct Pipe<T> {
    inner: Mutex<PipeInner<T>>,
}

struct PipeInner<T> {
    queue: VecDeque<T>,
    hwm: Option<usize>,
    lwm: Option<usize>,
    reads: usize,
    readable: bool,
}

impl<T> Pipe<T> {
    /// A pipe bounded at `hwm` messages; `None` disables the bound.
    #[must_use]
    pub fn new(hwm: Option<usize>) -> Self {
        let lwm = hwm.map(|h| (h + 1) / 2);
        Self {
            inner: Mutex::new(PipeInner {
                queue: VecDeque::new(),
                hwm,
                lwm,
                reads: 0,
                readable: false,
            }),
        }
    }

    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    #[must_use]
    pub fn bounded(hwm: usize) -> Self {
        Self::new(Some(hwm))
    }

    /// Append a message, failing with `Again` when the pipe is at its
    /// high watermark.
    ///
    /// Returns whether the pipe was already readable before the write;
    /// producers use a `false` return to kick an idle consumer.
    pub fn write(&self, item: T) -> Result<bool> {
        let mut inner = self.inner.lock();
        if let Some(hwm) = inner.hwm {
            if inner.queue.len() >= hwm {
                return Err(CapstanError::Again);
            }
        }
        Ok(inner.push(item))
    }

    /// Append past the high watermark. Used for drain sentinels that
    /// must reach the consumer even when the pipe is saturated.
    pub fn force_write(&self, item: T) -> bool {
        self.inner.lock().push(item)
    }

    /// Pop the oldest message.
    ///
    /// The second element is true once every low-watermark reads, the
    /// consumer's cue to reactivate a parked producer.
    pub fn read(&self) -> Result<(T, bool)> {
        let mut inner = self.inner.lock();
        let Some(item) = inner.queue.pop_front() else {
            inner.readable = false;
            return Err(CapstanError::Again);
        };
        let lwm_reached = match inner.lwm {
            Some(lwm) => {
                inner.reads = (inner.reads + 1) % lwm;
                inner.reads == 0
            }
            None => false,
        };
        Ok((item, lwm_reached))
    }

    /// Whether a read would currently succeed. Clears the readable flag
    /// when the queue is empty, so the next write reports the
    /// empty-to-readable transition.
    pub fn read_available(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.queue.is_empty() {
            inner.readable = false;
            false
        } else {
            true
        }
    }

    /// Whether a write would currently succeed.
    pub fn write_available(&self) -> bool {
        let inner = self.inner.lock();
        match inner.hwm {
            Some(hwm) => inner.queue.len() < hwm,
            None => true,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.readable = false;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> PipeInner<T> {
    fn push(&mut self, item: T) -> bool {
        let was_readable = self.readable;
        self.queue.push_back(item);
        self.readable = true;
        was_readable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let pipe = Pipe::unbounded();
        for i in 0..100 {
            pipe.write(i).unwrap();
        }
        for i in 0..100 {
            assert_eq!(pipe.read().unwrap().0, i);
        }
        assert!(pipe.read().unwrap_err().is_again());
    }

    #[test]
    fn write_reports_readable_transition() {
        let pipe = Pipe::unbounded();
        assert!(!pipe.write(1).unwrap());
        assert!(pipe.write(2).unwrap());

        pipe.read().unwrap();
        pipe.read().unwrap();
        assert!(!pipe.read_available());

        // Drained to empty: the next write is a fresh transition.
        assert!(!pipe.write(3).unwrap());
    }

    #[test]
    fn hwm_caps_the_queue_exactly() {
        let pipe = Pipe::bounded(4);
        for i in 0..4 {
            pipe.write(i).unwrap();
        }
        assert!(pipe.write(4).unwrap_err().is_again());
        assert!(!pipe.write_available());
    }

    #[test]
    fn lwm_signals_once_per_saturation() {
        // HWM 4 gives LWM 2: the signal fires on every second read.
        let pipe = Pipe::bounded(4);
        for i in 0..4 {
            pipe.write(i).unwrap();
        }
        assert!(pipe.write(99).unwrap_err().is_again());

        assert!(!pipe.read().unwrap().1);
        assert!(pipe.read().unwrap().1);

        // Room again: exactly one resume signal was produced.
        pipe.write(4).unwrap();
        assert!(!pipe.read().unwrap().1);
        assert!(pipe.read().unwrap().1);
    }

    #[test]
    fn force_write_bypasses_hwm() {
        let pipe = Pipe::bounded(1);
        pipe.write("data").unwrap();
        assert!(pipe.force_write("sentinel"));
        assert_eq!(pipe.len(), 2);
    }

    #[test]
    fn clear_resets_readable_state() {
        let pipe = Pipe::unbounded();
        pipe.write(1).unwrap();
        pipe.clear();
        assert!(pipe.is_empty());
        assert!(!pipe.write(2).unwrap());
    }
}
