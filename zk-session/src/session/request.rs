//! Requests, replies and reply sinks.

use std::fmt;
use std::sync::Arc;

use crate::error::SessionError;
use crate::proto::{ErrorCode, OpCode, PathRequest, ProtocolError, Xid, encode_request};

use super::watch::{WatchKind, WatchRegistration, WatchTarget, Watcher};

/// Invoked exactly once with the outcome of a request.
pub type ReplyCallback = Box<dyn FnOnce(Result<Reply, SessionError>) + Send + 'static>;

/// Server reply to one request.
///
/// `err` is the server's result code; a non-`Ok` code is still a delivered
/// reply, not a session error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub xid: Xid,
    pub zxid: i64,
    pub err: ErrorCode,
    pub payload: Vec<u8>,
}

impl Reply {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.err.is_ok()
    }
}

/// A caller operation: opcode, opaque encoded payload and an optional watch.
#[derive(Debug, Clone)]
pub struct Request {
    opcode: OpCode,
    payload: Vec<u8>,
    watch: Option<WatchRegistration>,
}

impl Request {
    #[must_use]
    pub const fn new(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            payload,
            watch: None,
        }
    }

    /// `exists` on `path`, optionally arming a watch.
    ///
    /// # Errors
    ///
    /// Fails only if the path does not fit a length field.
    pub fn exists(path: &str, watch: Option<WatchTarget>) -> Result<Self, ProtocolError> {
        Self::path_read(OpCode::Exists, WatchKind::Exists, path, watch)
    }

    /// `getData` on `path`, optionally arming a watch.
    ///
    /// # Errors
    ///
    /// Fails only if the path does not fit a length field.
    pub fn get_data(path: &str, watch: Option<WatchTarget>) -> Result<Self, ProtocolError> {
        Self::path_read(OpCode::GetData, WatchKind::Data, path, watch)
    }

    /// `getChildren` on `path`, optionally arming a watch.
    ///
    /// # Errors
    ///
    /// Fails only if the path does not fit a length field.
    pub fn get_children(path: &str, watch: Option<WatchTarget>) -> Result<Self, ProtocolError> {
        Self::path_read(OpCode::GetChildren, WatchKind::Child, path, watch)
    }

    fn path_read(
        opcode: OpCode,
        kind: WatchKind,
        path: &str,
        watch: Option<WatchTarget>,
    ) -> Result<Self, ProtocolError> {
        let payload = PathRequest {
            path: path.to_owned(),
            watch: watch.is_some(),
        }
        .to_payload()?;
        Ok(Self {
            opcode,
            payload,
            watch: watch.map(|target| WatchRegistration {
                path: path.to_owned(),
                kind,
                target,
            }),
        })
    }

    /// Routes the watch of this request to `watcher` instead of the default.
    #[must_use]
    pub fn watched_by(mut self, watcher: Arc<dyn Watcher>) -> Self {
        if let Some(reg) = self.watch.as_mut() {
            reg.target = WatchTarget::Custom(watcher);
        }
        self
    }

    #[must_use]
    pub const fn opcode(&self) -> OpCode {
        self.opcode
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub const fn watch(&self) -> Option<&WatchRegistration> {
        self.watch.as_ref()
    }
}

/// A request with its xid assigned, owned by the engine until completion.
pub(crate) struct OutboundRequest {
    pub(crate) xid: Xid,
    pub(crate) opcode: OpCode,
    pub(crate) payload: Vec<u8>,
    pub(crate) sink: Option<ReplyCallback>,
    pub(crate) watch: Option<WatchRegistration>,
    /// Engine traffic (ping, set-watches, close). Never awaits a reply
    /// and never produces a completion.
    pub(crate) internal: bool,
}

impl OutboundRequest {
    pub(crate) fn caller(xid: Xid, request: Request, sink: Option<ReplyCallback>) -> Self {
        Self {
            xid,
            opcode: request.opcode,
            payload: request.payload,
            sink,
            watch: request.watch,
            internal: false,
        }
    }

    pub(crate) const fn internal(xid: Xid, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            xid,
            opcode,
            payload,
            sink: None,
            watch: None,
            internal: true,
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_request(self.xid, self.opcode, &self.payload)
    }
}

impl fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundRequest")
            .field("xid", &self.xid)
            .field("opcode", &self.opcode)
            .field("payload_len", &self.payload.len())
            .field("has_sink", &self.sink.is_some())
            .field("watch", &self.watch)
            .field("internal", &self.internal)
            .finish()
    }
}
