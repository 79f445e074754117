//! Error taxonomy surfaced to callers and completion sinks.

use std::io;

use thiserror::Error;

use crate::proto::ProtocolError;
use crate::session::State;

/// Errors returned by session operations and delivered to reply sinks.
///
/// Transport and protocol failures never reach callers directly: the engine
/// reconnects and fails only the requests that were in flight with
/// [`SessionError::ConnectionLoss`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connection carrying the request went away before a reply.
    /// The session itself may still be alive.
    #[error("connection to the server was lost")]
    ConnectionLoss,
    /// The server refused to resume the session. Terminal.
    #[error("session expired")]
    SessionExpired,
    /// Malformed or out-of-order traffic.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The operation is not allowed in the handle's current state.
    #[error("operation not allowed in state {0}")]
    InvalidState(State),
    /// The handle is being closed; outstanding requests fail with this.
    #[error("session is closing")]
    Closing,
    /// Setting up an OS resource (socket, poller, thread) failed.
    #[error("resource error: {0}")]
    Resource(#[from] io::Error),
    /// The host string was malformed or resolved to no addresses.
    #[error("invalid host list: {0}")]
    InvalidHosts(String),
    /// A synchronous call gave up waiting; the request still completes.
    #[error("timed out waiting for reply")]
    Timeout,
}

impl SessionError {
    /// Whether the session survives this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectionLoss | Self::Protocol(_) | Self::Timeout)
    }
}
