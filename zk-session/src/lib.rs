//! Client session engine for a ZooKeeper-style coordination service.
//!
//! One session multiplexes requests over a single TCP connection to one
//! server of an ensemble, keeps the session alive with pings, reconnects to
//! other servers without losing the session, and re-arms watches after a
//! reconnect.
//!
//! - [`session::Session`]: cooperative handle; the embedder drives I/O.
//! - [`runtime::ThreadedSession`]: the same engine on its own threads.
//! - [`session::SessionHandle`]: cloneable submit/close access from any
//!   thread.

pub mod config;
pub mod error;
pub mod net;
pub mod proto;
pub mod runtime;
pub mod session;
pub mod sync;
mod trace;

pub use config::{HostOrder, SessionConfig, SessionCredentials};
pub use error::SessionError;
pub use runtime::ThreadedSession;
pub use session::{CloseStatus, Request, Session, SessionHandle, State, TeardownReport};
pub use trace::init_tracing;
