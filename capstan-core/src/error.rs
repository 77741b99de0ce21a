/// Capstan Error Types
///
/// Comprehensive error handling for all Capstan operations.
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for Capstan operations.
///
/// The type is cheap to clone: `io::Error` sources are held behind an
/// `Arc` so a single failure can fan out to every pending promise.
#[derive(Error, Debug, Clone)]
pub enum CapstanError {
    /// A non-blocking operation would have blocked
    #[error("operation would block")]
    Again,

    /// The socket is closed or closing
    #[error("socket closed")]
    ConnectionClosed,

    /// The socket is already bound or connected
    #[error("socket in use")]
    ConnectionInUse,

    /// Connecting to the remote peer failed
    #[error("connection failed (os error {0})")]
    Connection(i32),

    /// An operation was attempted in a state that does not permit it
    #[error("inconsistent state: {0}")]
    InconsistentState(&'static str),

    /// Incoming data does not conform to the wire protocol
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The byte stream is closed, possibly due to an underlying socket error
    #[error("stream closed")]
    Stream(Option<Arc<io::Error>>),

    /// IO error outside the byte stream (poller, waker, listener setup)
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

/// Result type alias for Capstan operations
pub type Result<T> = std::result::Result<T, CapstanError>;

impl CapstanError {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a stream-closed error wrapping an underlying socket error
    pub fn stream(source: io::Error) -> Self {
        Self::Stream(Some(Arc::new(source)))
    }

    /// The underlying `io::Error`, if this error wraps one
    #[must_use]
    pub fn io_source(&self) -> Option<&io::Error> {
        match self {
            Self::Stream(Some(e)) | Self::Io(e) => Some(e),
            _ => None,
        }
    }

    /// The raw OS error code, if one is attached
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Connection(errno) => Some(*errno),
            _ => self.io_source().and_then(io::Error::raw_os_error),
        }
    }

    /// Check whether this is the would-block marker
    #[must_use]
    pub const fn is_again(&self) -> bool {
        matches!(self, Self::Again)
    }

    /// Check whether the wrapped error is in the peer-reset family.
    ///
    /// Reset-family errors close the affected connection quietly instead
    /// of surfacing to the caller.
    #[must_use]
    pub fn is_reset(&self) -> bool {
        self.io_source().is_some_and(is_reset_error)
    }
}

impl From<io::Error> for CapstanError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Errors raised by a peer tearing the connection down.
///
/// ECONNRESET, ECONNABORTED, EPIPE, ETIMEDOUT, plus EPROTOTYPE on Darwin
/// where it leaks out of `send(2)` during teardown.
#[must_use]
pub fn is_reset_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    #[cfg(target_os = "macos")]
    if e.raw_os_error() == Some(41) {
        return true;
    }
    false
}
