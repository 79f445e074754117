//! Runtimes that drive a session engine.
//!
//! - `threaded`: dedicated I/O and completion threads around one engine.
//!
//! The cooperative [`crate::session::Session`] needs no runtime; its
//! embedder runs the loop.

pub mod threaded;

pub use threaded::ThreadedSession;
