//! Close arbitration and teardown reporting.
//!
//! A session can end two ways: the caller closes it, or the server expires
//! it. Both may race (an expiry watcher calling close is the classic case).
//! Whichever claims the lifecycle first runs teardown; the loser observes
//! an already-closed session and does nothing.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    /// Teardown is running.
    Closing,
    Closed,
}

/// Who started teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOrigin {
    Caller,
    Expiry,
}

/// What a teardown released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub origin: CloseOrigin,
    /// Caller requests failed because they never got a reply.
    pub failed_requests: usize,
    /// Whether a close request reached the socket before it was shut.
    pub close_request_sent: bool,
    pub transport_released: bool,
    /// Resolved endpoints dropped.
    pub hosts_released: usize,
    /// Active watches dropped.
    pub watches_released: usize,
    /// Worker threads joined (threaded mode only).
    pub workers_joined: usize,
}

impl TeardownReport {
    pub(crate) const fn new(origin: CloseOrigin) -> Self {
        Self {
            origin,
            failed_requests: 0,
            close_request_sent: false,
            transport_released: false,
            hosts_released: 0,
            watches_released: 0,
            workers_joined: 0,
        }
    }
}

/// Result of a close call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseStatus {
    /// This call ran teardown.
    Closed(TeardownReport),
    /// Teardown already ran (earlier close or expiry).
    AlreadyClosed,
}

impl CloseStatus {
    #[must_use]
    pub const fn report(&self) -> Option<&TeardownReport> {
        match self {
            Self::Closed(report) => Some(report),
            Self::AlreadyClosed => None,
        }
    }
}

/// Shared lifecycle flags.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    phase: AtomicU8,
    close_requested: AtomicBool,
}

impl Lifecycle {
    pub(crate) const fn new() -> Self {
        Self {
            phase: AtomicU8::new(OPEN),
            close_requested: AtomicBool::new(false),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            OPEN => Phase::Open,
            CLOSING => Phase::Closing,
            _ => Phase::Closed,
        }
    }

    /// Asks the engine owner to tear down. Returns `true` for the first
    /// request made while the session is still open.
    pub(crate) fn request_close(&self) -> bool {
        if self.phase() != Phase::Open {
            return false;
        }
        !self.close_requested.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Claims teardown. Exactly one caller ever gets `true`.
    pub(crate) fn begin_teardown(&self) -> bool {
        self.phase
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish_teardown(&self) {
        self.phase.store(CLOSED, Ordering::Release);
    }
}
