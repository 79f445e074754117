//! Network side of a session.
//!
//! - `endpoint`: a resolved server address.
//! - `hosts`: the parsed server list and its rotation.
//! - `transport`: the byte-stream connection the engine drives.

pub mod endpoint;
pub mod hosts;
pub mod transport;

pub use endpoint::Endpoint;
pub use hosts::HostList;
pub use transport::{TcpTransport, Transport};
