//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proto::DEFAULT_MAX_FRAME_LEN;

/// Port used when a host entry does not name one.
pub const DEFAULT_PORT: u16 = 2181;

/// Order in which servers from the host list are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HostOrder {
    /// Shuffle once at start so clients spread across the ensemble.
    #[default]
    Randomized,
    /// Keep the order given in the host string.
    Deterministic,
}

/// Configuration for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session timeout requested in the handshake. The server may negotiate
    /// it down or up.
    pub session_timeout: Duration,
    /// Deadline for a single connect attempt. `None` divides the session
    /// timeout by the number of hosts.
    pub connect_timeout: Option<Duration>,
    pub host_order: HostOrder,
    /// Pause after every host in the list failed once.
    pub reconnect_backoff: Duration,
    /// Upper bound on flushing the close request when closing a connected
    /// session.
    pub close_drain_timeout: Duration,
    /// Largest inbound frame body accepted.
    pub max_frame_len: usize,
    /// Size of the socket read buffer.
    pub read_chunk: usize,
    pub tcp_nodelay: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30),
            connect_timeout: None,
            host_order: HostOrder::Randomized,
            reconnect_backoff: Duration::from_secs(1),
            close_drain_timeout: Duration::from_millis(1500),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_chunk: 16 * 1024,
            tcp_nodelay: true,
        }
    }
}

/// Identity of an established session, kept by the embedder to resume it
/// on a new handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    /// `0` until the server grants a session.
    pub session_id: i64,
    pub password: Vec<u8>,
}

impl SessionCredentials {
    #[must_use]
    pub const fn is_established(&self) -> bool {
        self.session_id != 0
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_host_order(mut self, order: HostOrder) -> Self {
        self.host_order = order;
        self
    }

    /// Session timeout as the handshake's millisecond field, saturating.
    #[must_use]
    pub fn timeout_ms(&self) -> i32 {
        i32::try_from(self.session_timeout.as_millis()).unwrap_or(i32::MAX)
    }

    /// Effective per-attempt connect deadline for a list of `hosts` servers.
    #[must_use]
    pub fn connect_timeout_for(&self, hosts: usize) -> Duration {
        self.connect_timeout.unwrap_or_else(|| {
            let hosts = u32::try_from(hosts.max(1)).unwrap_or(u32::MAX);
            self.session_timeout / hosts
        })
    }
}
