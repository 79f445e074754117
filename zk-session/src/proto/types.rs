//! Wire records exchanged with the coordination servers.
//!
//! Handshake:
//!
//! ```text
//! ConnectRequest  = protocol_version(i32) last_zxid(i64) timeout_ms(i32)
//!                   session_id(i64) password(buffer)
//! ConnectResponse = protocol_version(i32) timeout_ms(i32)
//!                   session_id(i64) password(buffer)
//! ```
//!
//! Everything after the handshake is either a request
//! (`RequestHeader` + payload) or a reply (`ReplyHeader` + payload). Replies
//! with xid `-1` are unsolicited watcher events.

use std::fmt;

use super::codec::{ProtocolError, Reader, Writer};

/// Protocol version sent in the handshake.
pub const PROTOCOL_VERSION: i32 = 0;

/// Length of the session password issued by the server.
pub const PASSWORD_LEN: usize = 16;

/// Correlation identifier of a request.
///
/// Application requests get positive, monotonically increasing xids.
/// A handful of negative values are reserved for engine traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Xid(i32);

impl Xid {
    /// Unsolicited watcher event push.
    pub const WATCHER_EVENT: Self = Self(-1);
    /// Liveness ping.
    pub const PING: Self = Self(-2);
    /// Watch re-registration after reconnect.
    pub const SET_WATCHES: Self = Self(-8);

    #[must_use]
    pub const fn new(v: i32) -> Self {
        Self(v)
    }

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Whether this xid belongs to engine traffic rather than a caller.
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Notification = 0,
    Create = 1,
    Delete = 2,
    Exists = 3,
    GetData = 4,
    SetData = 5,
    GetAcl = 6,
    SetAcl = 7,
    GetChildren = 8,
    Sync = 9,
    Ping = 11,
    GetChildren2 = 12,
    Check = 13,
    Multi = 14,
    Auth = 100,
    SetWatches = 101,
    CloseSession = -11,
}

impl OpCode {
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Result code carried in every reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    SystemError,
    RuntimeInconsistency,
    DataInconsistency,
    ConnectionLoss,
    MarshallingError,
    Unimplemented,
    OperationTimeout,
    BadArguments,
    ApiError,
    NoNode,
    NoAuth,
    BadVersion,
    NoChildrenForEphemerals,
    NodeExists,
    NotEmpty,
    SessionExpired,
    InvalidCallback,
    InvalidAcl,
    AuthFailed,
    SessionMoved,
    Unknown(i32),
}

impl ErrorCode {
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::SystemError => -1,
            Self::RuntimeInconsistency => -2,
            Self::DataInconsistency => -3,
            Self::ConnectionLoss => -4,
            Self::MarshallingError => -5,
            Self::Unimplemented => -6,
            Self::OperationTimeout => -7,
            Self::BadArguments => -8,
            Self::ApiError => -100,
            Self::NoNode => -101,
            Self::NoAuth => -102,
            Self::BadVersion => -103,
            Self::NoChildrenForEphemerals => -108,
            Self::NodeExists => -110,
            Self::NotEmpty => -111,
            Self::SessionExpired => -112,
            Self::InvalidCallback => -113,
            Self::InvalidAcl => -114,
            Self::AuthFailed => -115,
            Self::SessionMoved => -118,
            Self::Unknown(v) => v,
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(v: i32) -> Self {
        match v {
            0 => Self::Ok,
            -1 => Self::SystemError,
            -2 => Self::RuntimeInconsistency,
            -3 => Self::DataInconsistency,
            -4 => Self::ConnectionLoss,
            -5 => Self::MarshallingError,
            -6 => Self::Unimplemented,
            -7 => Self::OperationTimeout,
            -8 => Self::BadArguments,
            -100 => Self::ApiError,
            -101 => Self::NoNode,
            -102 => Self::NoAuth,
            -103 => Self::BadVersion,
            -108 => Self::NoChildrenForEphemerals,
            -110 => Self::NodeExists,
            -111 => Self::NotEmpty,
            -112 => Self::SessionExpired,
            -113 => Self::InvalidCallback,
            -114 => Self::InvalidAcl,
            -115 => Self::AuthFailed,
            -118 => Self::SessionMoved,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(v) => write!(f, "unknown({v})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Connection state reported in watcher events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeeperState {
    Disconnected,
    SyncConnected,
    AuthFailed,
    ConnectedReadOnly,
    Expired,
    Closed,
    Other(i32),
}

impl KeeperState {
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::Disconnected => 0,
            Self::SyncConnected => 3,
            Self::AuthFailed => 4,
            Self::ConnectedReadOnly => 5,
            Self::Expired => -112,
            Self::Closed => 7,
            Self::Other(v) => v,
        }
    }
}

impl From<i32> for KeeperState {
    fn from(v: i32) -> Self {
        match v {
            0 => Self::Disconnected,
            3 => Self::SyncConnected,
            4 => Self::AuthFailed,
            5 => Self::ConnectedReadOnly,
            -112 => Self::Expired,
            7 => Self::Closed,
            other => Self::Other(other),
        }
    }
}

/// Kind of change reported by a watcher event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Session state change; carries no path.
    Session,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    Other(i32),
}

impl EventType {
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::Session => -1,
            Self::NodeCreated => 1,
            Self::NodeDeleted => 2,
            Self::NodeDataChanged => 3,
            Self::NodeChildrenChanged => 4,
            Self::Other(v) => v,
        }
    }
}

impl From<i32> for EventType {
    fn from(v: i32) -> Self {
        match v {
            -1 => Self::Session,
            1 => Self::NodeCreated,
            2 => Self::NodeDeleted,
            3 => Self::NodeDataChanged,
            4 => Self::NodeChildrenChanged,
            other => Self::Other(other),
        }
    }
}

/// Handshake request written right after the transport connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_version: i32,
    /// Highest zxid this client has observed; the server refuses to resume
    /// a session from a server that is behind it.
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    /// `0` asks for a new session.
    pub session_id: i64,
    pub password: Vec<u8>,
}

impl ConnectRequest {
    /// Encodes the request as a complete frame.
    ///
    /// # Errors
    ///
    /// Fails only if the password does not fit a length field.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = Writer::frame();
        w.put_i32(self.protocol_version);
        w.put_i64(self.last_zxid_seen);
        w.put_i32(self.timeout_ms);
        w.put_i64(self.session_id);
        w.put_buffer(Some(&self.password))?;
        w.finish()
    }

    /// Decodes a request from a frame body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is truncated.
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(body);
        Ok(Self {
            protocol_version: r.take_i32()?,
            last_zxid_seen: r.take_i64()?,
            timeout_ms: r.take_i32()?,
            session_id: r.take_i64()?,
            password: r.take_buffer()?,
        })
    }
}

/// Handshake response.
///
/// A non-positive `timeout_ms` means the server refused to create or resume
/// the session: the session is expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
}

impl ConnectResponse {
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        self.timeout_ms > 0
    }

    /// Encodes the response as a complete frame.
    ///
    /// # Errors
    ///
    /// Fails only if the password does not fit a length field.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = Writer::frame();
        w.put_i32(self.protocol_version);
        w.put_i32(self.timeout_ms);
        w.put_i64(self.session_id);
        w.put_buffer(Some(&self.password))?;
        w.finish()
    }

    /// Decodes a response from a frame body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is truncated.
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(body);
        Ok(Self {
            protocol_version: r.take_i32()?,
            timeout_ms: r.take_i32()?,
            session_id: r.take_i64()?,
            password: r.take_buffer()?,
        })
    }
}

/// Header in front of every request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub xid: Xid,
    pub opcode: i32,
}

impl RequestHeader {
    /// Decodes the header, returning it with the remaining payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is shorter than a header.
    pub fn decode(body: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let mut r = Reader::new(body);
        let header = Self {
            xid: Xid::new(r.take_i32()?),
            opcode: r.take_i32()?,
        };
        Ok((header, r.rest()))
    }
}

/// Header in front of every reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: Xid,
    pub zxid: i64,
    pub err: ErrorCode,
}

impl ReplyHeader {
    /// Decodes the header, returning it with the remaining payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is shorter than a header.
    pub fn decode(body: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let mut r = Reader::new(body);
        let header = Self {
            xid: Xid::new(r.take_i32()?),
            zxid: r.take_i64()?,
            err: ErrorCode::from(r.take_i32()?),
        };
        Ok((header, r.rest()))
    }
}

/// Encodes a request frame: header followed by the opaque payload.
///
/// # Errors
///
/// Fails only if the frame exceeds the length field.
pub fn encode_request(xid: Xid, opcode: OpCode, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut w = Writer::frame();
    w.put_i32(xid.as_i32());
    w.put_i32(opcode.as_i32());
    w.put_raw(payload);
    w.finish()
}

/// Encodes a reply frame: header followed by the payload.
///
/// Used by server-side test fixtures.
///
/// # Errors
///
/// Fails only if the frame exceeds the length field.
pub fn encode_reply(header: ReplyHeader, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut w = Writer::frame();
    w.put_i32(header.xid.as_i32());
    w.put_i64(header.zxid);
    w.put_i32(header.err.as_i32());
    w.put_raw(payload);
    w.finish()
}

/// Body of an unsolicited watcher event push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub event_type: EventType,
    pub state: KeeperState,
    pub path: String,
}

impl WatcherEvent {
    /// Decodes the event from the payload following a reply header.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is truncated or the path is not UTF-8.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            event_type: EventType::from(r.take_i32()?),
            state: KeeperState::from(r.take_i32()?),
            path: r.take_string()?,
        })
    }

    /// Encodes the event as a complete push frame.
    ///
    /// # Errors
    ///
    /// Fails only if the path exceeds a length field.
    pub fn encode_push(&self, zxid: i64) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Writer::payload();
        body.put_i32(self.event_type.as_i32());
        body.put_i32(self.state.as_i32());
        body.put_str(&self.path)?;
        let body = body.finish()?;
        encode_reply(
            ReplyHeader {
                xid: Xid::WATCHER_EVENT,
                zxid,
                err: ErrorCode::Ok,
            },
            &body,
        )
    }
}

/// Re-registration of durable watches on a fresh connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetWatches {
    /// Last zxid seen; the server fires any watch whose node changed since.
    pub relative_zxid: i64,
    pub data: Vec<String>,
    pub exist: Vec<String>,
    pub child: Vec<String>,
}

impl SetWatches {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.exist.is_empty() && self.child.is_empty()
    }

    /// Encodes the request payload.
    ///
    /// # Errors
    ///
    /// Fails only if a path or list exceeds a length field.
    pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = Writer::payload();
        w.put_i64(self.relative_zxid);
        w.put_str_vec(&self.data)?;
        w.put_str_vec(&self.exist)?;
        w.put_str_vec(&self.child)?;
        w.finish()
    }

    /// Decodes a request payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is truncated.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            relative_zxid: r.take_i64()?,
            data: r.take_str_vec()?,
            exist: r.take_str_vec()?,
            child: r.take_str_vec()?,
        })
    }
}

/// Payload shared by `exists`, `getData` and `getChildren`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRequest {
    pub path: String,
    pub watch: bool,
}

impl PathRequest {
    /// Encodes the request payload.
    ///
    /// # Errors
    ///
    /// Fails only if the path exceeds a length field.
    pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = Writer::payload();
        w.put_str(&self.path)?;
        w.put_bool(self.watch);
        w.finish()
    }

    /// Decodes a request payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is truncated.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            path: r.take_string()?,
            watch: r.take_bool()?,
        })
    }
}
