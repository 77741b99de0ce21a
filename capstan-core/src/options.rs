//! Per-socket configuration.

/// Options applied to a socket at creation time.
///
/// The watermarks bound the in-memory pipes between the socket facade
/// and its stream engines. `None` leaves a pipe unbounded, which
/// disables backpressure on that side.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOptions {
    /// High watermark for outgoing messages (facade to engine).
    pub send_hwm: Option<usize>,
    /// High watermark for incoming messages (engine to facade).
    pub recv_hwm: Option<usize>,
}

impl SocketOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both watermarks to the same bound.
    #[must_use]
    pub const fn with_hwm(hwm: usize) -> Self {
        Self {
            send_hwm: Some(hwm),
            recv_hwm: Some(hwm),
        }
    }

    #[must_use]
    pub const fn send_hwm(mut self, hwm: usize) -> Self {
        self.send_hwm = Some(hwm);
        self
    }

    #[must_use]
    pub const fn recv_hwm(mut self, hwm: usize) -> Self {
        self.recv_hwm = Some(hwm);
        self
    }
}
