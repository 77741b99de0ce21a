//! Capstan Wire
//!
//! The protocol layer: length-framed codec, the per-connection stream
//! engine, and the four socket pattern state machines (REQUESTER,
//! REPLIER, PUSHER, PULLER) that the facade crate drives.

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

pub mod codec;
pub mod engine;
pub mod pattern;
pub mod pull;
pub mod push;
pub mod rep;
pub mod req;

pub use codec::{encode_frames, FrameHeader, FRAME_HEADER_LEN, MAX_PACKET};
pub use engine::{SendItem, StreamEngine};
pub use pattern::{Pattern, SocketType};
pub use pull::Puller;
pub use push::Pusher;
pub use rep::Replier;
pub use req::Requester;
