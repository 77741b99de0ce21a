//! Capstan Core
//!
//! This crate contains the concurrency and I/O substrate the socket
//! patterns are built on:
//! - Readiness polling over epoll/kqueue (`poller`, `event`)
//! - The reactor: fd handlers, deferred callbacks, timers (`io_loop`)
//! - Single-shot promises and the cooperative task runtime (`promise`, `task`)
//! - Non-blocking TCP byte stream (`stream`, `buffer`)
//! - Bounded message pipes with watermark backpressure (`pipe`)
//! - Cross-thread command mailbox and self-pipe waker (`mailbox`, `waker`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod buffer;
pub mod error;
pub mod event;
pub mod io_loop;
pub mod mailbox;
pub mod options;
pub mod pipe;
pub mod poller;
pub mod promise;
pub mod stream;
pub mod task;
pub mod waker;

pub use error::{CapstanError, Result};
pub use event::EventSet;
pub use io_loop::{IoLoop, TimeoutHandle};
pub use mailbox::{Command, EngineId, Mailbox};
pub use options::SocketOptions;
pub use pipe::Pipe;
pub use promise::Promise;
pub use stream::SocketStream;
pub use task::{run_sync, yield_now};
pub use waker::Waker;
