//! Single-shot result cells.
//!
//! A `Promise<T>` is resolved exactly once, from any thread. Awaiters
//! observe completion either through done-callbacks (a callback added
//! after resolution fires immediately) or by `.await`ing the promise,
//! which suspends the surrounding task until the producer completes it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::warn;

use crate::error::{CapstanError, Result};

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send>;

pub struct Promise<T> {
    shared: Arc<Mutex<State<T>>>,
}

struct State<T> {
    result: Option<Result<T>>,
    waker: Option<Waker>,
    callbacks: SmallVec<[Callback<T>; 1]>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(State {
                result: None,
                waker: None,
                callbacks: SmallVec::new(),
            })),
        }
    }

    /// A promise born resolved.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        let promise = Self::new();
        promise.resolve(value);
        promise
    }

    /// A promise born failed.
    #[must_use]
    pub fn failed(error: CapstanError) -> Self {
        let promise = Self::new();
        promise.fail(error);
        promise
    }

    pub fn resolve(&self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(&self, error: CapstanError) {
        self.complete(Err(error));
    }

    /// Install the result and notify all observers. A promise resolves
    /// exactly once; a second completion keeps the first result.
    pub fn complete(&self, result: Result<T>) {
        let (waker, callbacks) = {
            let mut state = self.shared.lock();
            if state.result.is_some() {
                warn!("promise completed twice; keeping the first result");
                return;
            }
            state.result = Some(result.clone());
            (state.waker.take(), std::mem::take(&mut state.callbacks))
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        for callback in callbacks {
            callback(result.clone());
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.lock().result.is_some()
    }

    /// The result, when complete.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<T>> {
        self.shared.lock().result.clone()
    }

    /// Run `callback` with the result once the promise completes.
    /// Fires on the completing thread, or immediately on the calling
    /// thread when the promise is already done.
    pub fn add_done_callback(&self, callback: impl FnOnce(Result<T>) + Send + 'static) {
        let ready = {
            let mut state = self.shared.lock();
            match &state.result {
                Some(result) => Some(result.clone()),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(ready.unwrap());
    }
}

impl<T: Clone + Send + 'static> Future for Promise<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();
        if let Some(result) = &state.result {
            Poll::Ready(result.clone())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}
