//! # Capstan
//!
//! An in-process messaging runtime: typed sockets speaking a
//! length-framed protocol over TCP, with a synchronous send/recv
//! surface in front of a dedicated reactor thread.
//!
//! ## Architecture
//!
//! Capstan is structured in three layers:
//!
//! - **`capstan-core`**: the reactor, promise/task runtime, byte
//!   stream, pipes, mailbox and waker
//! - **`capstan-wire`**: the frame codec, per-connection stream
//!   engines, and the four pattern state machines
//! - **`capstan`**: public API surface (this crate)
//!
//! User code and the reactor never share mutable structures directly:
//! messages cross on bounded pipes, control signals cross on the
//! mailbox, and the pipe watermarks carry backpressure end to end.
//!
//! ## Socket types
//!
//! | Type        | Role               | bind | connect | ordering          |
//! |-------------|--------------------|------|---------|-------------------|
//! | `Requester` | client             | no   | yes     | send, recv, send… |
//! | `Replier`   | server             | yes  | no      | recv, send, recv… |
//! | `Pusher`    | pipeline producer  | no   | yes     | free              |
//! | `Puller`    | pipeline consumer  | yes  | no      | free              |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use capstan::{Context, SocketType};
//!
//! fn main() -> capstan::Result<()> {
//!     let ctx = Context::new()?;
//!
//!     let server = ctx.socket(SocketType::Replier)?;
//!     server.bind("127.0.0.1:0".parse().unwrap())?;
//!     let addr = server.local_addr()?;
//!
//!     let client = ctx.socket(SocketType::Requester)?;
//!     client.connect(addr)?;
//!
//!     client.send(&b"ping"[..])?;
//!     let request = server.recv()?;
//!     server.send(request)?;
//!     let reply = client.recv()?;
//!     assert_eq!(&reply[..], b"ping");
//!
//!     client.close()?;
//!     server.close()?;
//!     ctx.stop();
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]

// Re-export core types
pub use bytes::Bytes;
pub use capstan_core::{CapstanError, EventSet, Result, SocketOptions};
pub use capstan_wire::SocketType;

mod context;
mod socket;

pub use context::Context;
pub use socket::Socket;

/// Development helpers (tests/examples)
pub mod dev_tracing;
