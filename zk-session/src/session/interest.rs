//! What the engine wants from the embedder's poller, and what it got back.

use std::os::fd::RawFd;
use std::time::Duration;

use minstant::Instant;

/// I/O interest for the next wait.
///
/// The embedder waits until the descriptor is ready for any requested
/// direction or `deadline` passes, whichever comes first, then calls
/// `process` with what happened.
#[derive(Debug, Clone, Copy)]
pub struct Interest {
    /// Socket to poll. `None` while no transport is open.
    pub descriptor: Option<RawFd>,
    pub readable: bool,
    pub writable: bool,
    /// Next timer the engine must observe (ping, liveness, reconnect).
    pub deadline: Instant,
}

impl Interest {
    /// Time left until `deadline`, zero if already passed.
    #[must_use]
    pub fn timeout_from(&self, now: Instant) -> Duration {
        self.deadline
            .checked_duration_since(now)
            .unwrap_or(Duration::ZERO)
    }
}

/// Readiness reported by the embedder's poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Error or hang-up reported on the descriptor.
    pub error: bool,
}

impl Readiness {
    /// Nothing ready; only timers are due.
    pub const NONE: Self = Self {
        readable: false,
        writable: false,
        error: false,
    };

    /// Readable and writable at once.
    pub const BOTH: Self = Self {
        readable: true,
        writable: true,
        error: false,
    };

    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
        error: false,
    };

    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
        error: false,
    };

    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.readable && !self.writable && !self.error
    }
}
