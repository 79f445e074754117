//! Resolved server addresses.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// One resolved server address plus the host name it came from.
///
/// A single host entry may resolve to several endpoints; they share the
/// label so log lines still show what the caller wrote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: SocketAddr,
    host: Arc<str>,
}

impl Endpoint {
    #[must_use]
    pub fn new(addr: SocketAddr, host: impl Into<Arc<str>>) -> Self {
        Self {
            addr,
            host: host.into(),
        }
    }

    /// Loopback endpoint, mainly for tests and local tooling.
    #[must_use]
    pub fn localhost(port: u16) -> Self {
        Self::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Host name as written in the host string.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            addr,
            host: addr.ip().to_string().into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<std::net::IpAddr>().is_ok() {
            self.addr.fmt(f)
        } else {
            write!(f, "{}({})", self.host, self.addr)
        }
    }
}
