//! Thread-safe queues between callers, the engine and the delivery context.
//!
//! - `submit`: requests flowing from any caller thread into the engine.
//! - `completion`: replies and events flowing from the engine to delivery.

pub mod completion;
pub(crate) mod submit;

pub use completion::{CompletionQueue, Timeout};
