//! Readiness event masks shared by the poller, the reactor and the
//! socket facade.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// A set of readiness interests or observed events on a file descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u8);

impl EventSet {
    /// The empty set.
    pub const NONE: EventSet = EventSet(0);
    /// Readable, or a pending inbound connection on a listener.
    pub const READABLE: EventSet = EventSet(0b001);
    /// Writable, or an outbound connect completing.
    pub const WRITABLE: EventSet = EventSet(0b010);
    /// Error condition reported by the OS for the descriptor.
    pub const ERROR: EventSet = EventSet(0b100);

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub const fn union(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        self.union(rhs)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = f.debug_set();
        if self.is_readable() {
            parts.entry(&"READABLE");
        }
        if self.is_writable() {
            parts.entry(&"WRITABLE");
        }
        if self.is_error() {
            parts.entry(&"ERROR");
        }
        parts.finish()
    }
}
