//! Wire codec for the client/server protocol.
//!
//! - `codec`: primitive big-endian encoding and length-prefixed framing.
//! - `types`: handshake, headers, watcher events and the few request
//!   payloads the engine itself produces.
//!
//! Payloads of individual operations are opaque to the engine; callers hand
//! in encoded bytes and receive the raw reply payload back.

pub mod codec;
pub mod types;

pub use codec::{DEFAULT_MAX_FRAME_LEN, FrameAssembler, ProtocolError, Reader, Writer};
pub use types::{
    ConnectRequest, ConnectResponse, ErrorCode, EventType, KeeperState, OpCode, PASSWORD_LEN,
    PROTOCOL_VERSION, PathRequest, ReplyHeader, RequestHeader, SetWatches, WatcherEvent, Xid,
    encode_reply, encode_request,
};
