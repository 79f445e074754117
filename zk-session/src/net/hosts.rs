//! Server list parsing and rotation.

use std::net::ToSocketAddrs;

use rand::seq::SliceRandom;

use crate::config::{DEFAULT_PORT, HostOrder};
use crate::error::SessionError;
use crate::trace::{debug, warn};

use super::Endpoint;

/// Ordered list of resolved server endpoints with a rotation cursor.
///
/// Every host entry is resolved once at start; each resolved address becomes
/// its own endpoint. Connect attempts walk the list round-robin. A full
/// cycle without a successful handshake is reported so the caller can back
/// off before starting over.
#[derive(Debug)]
pub struct HostList {
    endpoints: Vec<Endpoint>,
    cursor: usize,
    failed_in_cycle: usize,
}

impl HostList {
    /// Parses and resolves a comma-separated `host[:port]` list.
    ///
    /// IPv6 literals with a port must be bracketed (`[::1]:2181`). Entries
    /// without a port use 2181. Blank entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidHosts`] if an entry is malformed or the
    /// list resolves to no addresses.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn parse(list: &str, order: HostOrder) -> Result<Self, SessionError> {
        let mut endpoints = Vec::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (host, port) = split_host_port(entry)?;
            match (host, port).to_socket_addrs() {
                Ok(addrs) => {
                    let before = endpoints.len();
                    endpoints.extend(addrs.map(|addr| Endpoint::new(addr, host)));
                    debug!(entry, resolved = endpoints.len() - before, "resolved host entry");
                }
                Err(e) => {
                    warn!(entry, error = %e, "failed to resolve host entry");
                }
            }
        }
        Self::from_endpoints(endpoints, order)
    }

    /// Builds a list from already-resolved endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidHosts`] if `endpoints` is empty.
    pub fn from_endpoints(
        mut endpoints: Vec<Endpoint>,
        order: HostOrder,
    ) -> Result<Self, SessionError> {
        if endpoints.is_empty() {
            return Err(SessionError::InvalidHosts(
                "no resolvable server addresses".into(),
            ));
        }
        if order == HostOrder::Randomized {
            endpoints.shuffle(&mut rand::rng());
        }
        Ok(Self {
            endpoints,
            cursor: 0,
            failed_in_cycle: 0,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Returns the next endpoint to try, advancing the cursor.
    pub fn next_endpoint(&mut self) -> Option<Endpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        let ep = self.endpoints[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.endpoints.len();
        Some(ep)
    }

    /// Records a failed attempt. Returns `true` when every endpoint has
    /// failed since the last success; the counter restarts.
    pub fn record_failure(&mut self) -> bool {
        self.failed_in_cycle += 1;
        if self.failed_in_cycle >= self.endpoints.len() {
            self.failed_in_cycle = 0;
            true
        } else {
            false
        }
    }

    /// Records a completed handshake.
    pub fn record_success(&mut self) {
        self.failed_in_cycle = 0;
    }

    /// Drops every endpoint, returning how many were held.
    pub fn release(&mut self) -> usize {
        let held = self.endpoints.len();
        self.endpoints = Vec::new();
        self.cursor = 0;
        self.failed_in_cycle = 0;
        held
    }
}

fn split_host_port(entry: &str) -> Result<(&str, u16), SessionError> {
    let invalid = || SessionError::InvalidHosts(format!("malformed entry {entry:?}"));
    let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid());

    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail {
            "" => DEFAULT_PORT,
            _ => parse_port(tail.strip_prefix(':').ok_or_else(invalid)?)?,
        };
        return Ok((host, port));
    }

    match entry.rsplit_once(':') {
        // Bare IPv6 literal without a port.
        Some((host, _)) if host.contains(':') => Ok((entry, DEFAULT_PORT)),
        Some((host, port)) if !host.is_empty() => Ok((host, parse_port(port)?)),
        Some(_) => Err(invalid()),
        None => Ok((entry, DEFAULT_PORT)),
    }
}
