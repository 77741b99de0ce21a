//! Cooperative task support: the per-task waker, the voluntary yield
//! point, and the synchronous bridge used to drive a promise to
//! completion on a dedicated reactor.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crate::error::{CapstanError, Result};
use crate::io_loop::{IoLoop, Runnable};
use crate::promise::Promise;

/// Re-schedules its task on the owning loop. Promise completions may
/// happen on any thread; the resume always lands back on the loop.
pub(crate) struct TaskWaker {
    io_loop: IoLoop,
    id: u64,
}

impl TaskWaker {
    pub(crate) fn waker(io_loop: IoLoop, id: u64) -> Waker {
        Waker::from(Arc::new(TaskWaker { io_loop, id }))
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.io_loop.enqueue(Runnable::Resume(self.id));
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.io_loop.enqueue(Runnable::Resume(self.id));
    }
}

/// Yield the processor for one reactor turn.
///
/// Everything already queued on the loop runs before the task resumes.
#[must_use]
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Block the calling thread until `promise` resolves, by running
/// `io_loop` and arranging for completion to stop it. Returns the
/// promise's value or re-raises its error.
pub fn run_sync<T: Clone + Send + 'static>(promise: &Promise<T>, io_loop: &IoLoop) -> Result<T> {
    if let Some(result) = promise.try_result() {
        return result;
    }
    let lp = io_loop.clone();
    promise.add_done_callback(move |_| {
        let stopper = lp.clone();
        lp.next_tick(move || stopper.stop());
    });
    io_loop.run()?;
    promise.try_result().unwrap_or(Err(CapstanError::InconsistentState(
        "reactor stopped before the promise resolved",
    )))
}
