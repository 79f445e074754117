//! Primitive encoding and length-prefixed framing.
//!
//! Every frame on the wire is a 4-byte big-endian body length followed by
//! the body:
//!
//! ```text
//! ┌───────────────┬──────────────────────────────────────────┐
//! │ Length (4)    │ Body (Length bytes)                      │
//! └───────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Integers are big-endian. Strings and byte buffers are an `i32` length
//! followed by the bytes; a length of `-1` encodes an absent buffer.

use thiserror::Error;

/// Size of the length prefix in front of every frame.
pub const LENGTH_PREFIX: usize = 4;

/// Largest frame body accepted by default (matches the server's 4 MiB
/// packet ceiling).
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Errors during encode/decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Not enough bytes left to decode the next field.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    /// A frame announced a body larger than allowed.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    /// A length field was negative where an absent value is not allowed.
    #[error("negative length field: {0}")]
    NegativeLength(i32),
    /// A string field held invalid UTF-8.
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    /// A reply arrived for a different request than the oldest in flight.
    #[error("reply xid {got} does not match oldest in-flight xid {expected}")]
    UnexpectedXid { expected: i32, got: i32 },
    /// A reply arrived while nothing was in flight.
    #[error("reply xid {0} with no request in flight")]
    UnsolicitedReply(i32),
}

/// Writer for request bodies and frames.
///
/// A framed writer reserves the length prefix up front and patches it in
/// [`Writer::finish`]; a payload writer produces bare bytes for embedding in
/// another frame.
pub struct Writer {
    buf: Vec<u8>,
    framed: bool,
}

impl Writer {
    /// Starts a length-prefixed frame.
    #[must_use]
    pub fn frame() -> Self {
        Self {
            buf: vec![0u8; LENGTH_PREFIX],
            framed: true,
        }
    }

    /// Starts an unframed payload.
    #[must_use]
    pub const fn payload() -> Self {
        Self {
            buf: Vec::new(),
            framed: false,
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(u8::from(v));
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends bytes verbatim (no length field).
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Appends a length-prefixed buffer; `None` encodes as length `-1`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] if the buffer length does not
    /// fit the `i32` length field.
    pub fn put_buffer(&mut self, bytes: Option<&[u8]>) -> Result<(), ProtocolError> {
        match bytes {
            None => self.put_i32(-1),
            Some(bytes) => {
                self.put_i32(length_field(bytes.len())?);
                self.put_raw(bytes);
            }
        }
        Ok(())
    }

    /// Appends a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// See [`Writer::put_buffer`].
    pub fn put_str(&mut self, s: &str) -> Result<(), ProtocolError> {
        self.put_buffer(Some(s.as_bytes()))
    }

    /// Appends a count-prefixed vector of strings.
    ///
    /// # Errors
    ///
    /// See [`Writer::put_buffer`].
    pub fn put_str_vec<S: AsRef<str>>(&mut self, items: &[S]) -> Result<(), ProtocolError> {
        self.put_i32(length_field(items.len())?);
        for item in items {
            self.put_str(item.as_ref())?;
        }
        Ok(())
    }

    /// Completes the writer, patching the length prefix of a frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] if the body length does not
    /// fit the length prefix.
    pub fn finish(mut self) -> Result<Vec<u8>, ProtocolError> {
        if self.framed {
            let body = length_field(self.buf.len() - LENGTH_PREFIX)?;
            self.buf[..LENGTH_PREFIX].copy_from_slice(&body.to_be_bytes());
        }
        Ok(self.buf)
    }
}

fn length_field(len: usize) -> Result<i32, ProtocolError> {
    i32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        len,
        max: i32::MAX as usize,
    })
}

/// Reader over a decoded frame body.
pub struct Reader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// Returns everything not yet consumed.
    #[must_use]
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.cursor..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::BufferTooSmall {
                need: n,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(bytes)
    }

    pub fn take_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn take_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.take_u8()? != 0)
    }

    pub fn take_i32(&mut self) -> Result<i32, ProtocolError> {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.take(4)?);
        Ok(i32::from_be_bytes(arr))
    }

    pub fn take_i64(&mut self) -> Result<i64, ProtocolError> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(arr))
    }

    /// Reads a length-prefixed buffer; an absent buffer reads as empty.
    pub fn take_buffer(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.take_i32()?;
        if len < 0 {
            return Ok(Vec::new());
        }
        // Non-negative i32 always fits usize on supported targets.
        let len = usize::try_from(len).map_err(|_| ProtocolError::NegativeLength(len))?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn take_string(&mut self) -> Result<String, ProtocolError> {
        String::from_utf8(self.take_buffer()?).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn take_str_vec(&mut self) -> Result<Vec<String>, ProtocolError> {
        let count = self.take_i32()?;
        if count < 0 {
            return Ok(Vec::new());
        }
        (0..count).map(|_| self.take_string()).collect()
    }
}

/// Accumulates inbound bytes and splits them into frame bodies.
///
/// Bytes arrive in arbitrary chunks from a stream socket; a frame is handed
/// out only once its full body is buffered.
pub struct FrameAssembler {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameAssembler {
    #[must_use]
    pub const fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet handed out.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drops any partial frame (used when the connection epoch ends).
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pops the next complete frame body, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns an error if the announced length is negative or exceeds the
    /// configured maximum. The stream is unusable afterwards.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut arr = [0u8; LENGTH_PREFIX];
        arr.copy_from_slice(&self.buf[..LENGTH_PREFIX]);
        let announced = i32::from_be_bytes(arr);
        let len = usize::try_from(announced).map_err(|_| ProtocolError::NegativeLength(announced))?;
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if self.buf.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }
        let body = self.buf[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec();
        self.buf.drain(..LENGTH_PREFIX + len);
        Ok(Some(body))
    }
}
