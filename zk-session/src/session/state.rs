//! Session connection states.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Connection state of a session handle.
///
/// ```text
/// Disconnected ──► Connecting ──► Associating ──► Connected
///       ▲              │               │              │
///       └──────────────┴───────────────┴──────────────┘  transport failure
///
/// any ──► Closed   (caller close)
/// any ──► Expired  (server refused the session)
/// ```
///
/// `Closed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    /// No transport; the next interest call starts a connect.
    Disconnected = 0,
    /// Non-blocking connect in progress.
    Connecting = 1,
    /// Transport up, handshake written, waiting for the response.
    Associating = 2,
    Connected = 3,
    Closed = 4,
    Expired = 5,
}

impl State {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Expired)
    }

    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Associating,
            3 => Self::Connected,
            4 => Self::Closed,
            _ => Self::Expired,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Associating => "ASSOCIATING",
            Self::Connected => "CONNECTED",
            Self::Closed => "CLOSED",
            Self::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

/// A state change observed during one engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: State,
    pub to: State,
}

/// Published copy of the engine's state, readable from any thread.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) const fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }
}
