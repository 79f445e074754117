//! Request/response multiplexing over one connection epoch.
//!
//! Requests move through three stages:
//!
//! ```text
//! pending ──► writing ──► sent ──► (reply matched at head)
//! ```
//!
//! `writing` holds the one frame partially written to the socket; nothing
//! overtakes it. A request enters `sent` only once its last byte is
//! written. The server answers in send order, so a reply must match the
//! head of `sent`.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};

use crate::net::Transport;
use crate::proto::{ProtocolError, Xid};
use crate::sync::submit::SubmitQueue;

use super::request::OutboundRequest;

struct WriteCursor {
    frame: Vec<u8>,
    offset: usize,
    /// `None` for the handshake, which is not a request.
    request: Option<OutboundRequest>,
}

/// Result of one flush.
#[derive(Debug, Default)]
pub(crate) struct FlushOutcome {
    pub(crate) bytes: usize,
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    pub(crate) frames: usize,
    /// Requests that could not be encoded; they never reach the wire.
    pub(crate) rejected: Vec<(OutboundRequest, ProtocolError)>,
    /// Fatal transport error, if the flush stopped on one.
    pub(crate) error: Option<io::Error>,
}

#[derive(Default)]
pub(crate) struct Multiplexer {
    pending: VecDeque<OutboundRequest>,
    writing: Option<WriteCursor>,
    sent: VecDeque<OutboundRequest>,
}

impl Multiplexer {
    /// Starts an epoch by putting the handshake frame ahead of everything.
    pub(crate) fn begin_epoch(&mut self, handshake: Vec<u8>) {
        debug_assert!(self.writing.is_none() && self.sent.is_empty());
        self.writing = Some(WriteCursor {
            frame: handshake,
            offset: 0,
            request: None,
        });
    }

    /// Moves newly submitted requests behind the local pending queue.
    pub(crate) fn pull(&mut self, submit: &SubmitQueue) -> usize {
        submit.drain_into(&mut self.pending)
    }

    pub(crate) fn absorb(&mut self, requests: &mut VecDeque<OutboundRequest>) {
        self.pending.append(requests);
    }

    pub(crate) fn push_front(&mut self, request: OutboundRequest) {
        self.pending.push_front(request);
    }

    pub(crate) fn push_back(&mut self, request: OutboundRequest) {
        self.pending.push_back(request);
    }

    /// Whether a flush has anything to write.
    pub(crate) fn has_output(&self, requests_allowed: bool) -> bool {
        self.writing.is_some() || (requests_allowed && !self.pending.is_empty())
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.sent.len()
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending.len() + usize::from(self.writing.as_ref().is_some_and(|c| c.request.is_some()))
    }

    /// Writes frames until the socket would block or nothing is left.
    ///
    /// With `requests_allowed` false only an already started frame (the
    /// handshake) is written.
    pub(crate) fn flush<T: Transport>(
        &mut self,
        transport: &mut T,
        requests_allowed: bool,
    ) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        loop {
            if self.writing.is_none() {
                if !requests_allowed {
                    break;
                }
                let Some(request) = self.pending.pop_front() else {
                    break;
                };
                match request.encode() {
                    Ok(frame) => {
                        self.writing = Some(WriteCursor {
                            frame,
                            offset: 0,
                            request: Some(request),
                        });
                    }
                    Err(e) => {
                        outcome.rejected.push((request, e));
                        continue;
                    }
                }
            }
            let Some(cursor) = self.writing.as_mut() else {
                break;
            };
            match transport.send(&cursor.frame[cursor.offset..]) {
                Ok(0) => {
                    outcome.error = Some(ErrorKind::WriteZero.into());
                    break;
                }
                Ok(n) => {
                    cursor.offset += n;
                    outcome.bytes += n;
                    if cursor.offset == cursor.frame.len() {
                        outcome.frames += 1;
                        if let Some(cursor) = self.writing.take()
                            && let Some(mut request) = cursor.request
                            && !request.internal
                        {
                            request.payload = Vec::new();
                            self.sent.push_back(request);
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        outcome
    }

    /// Pops the request a reply with `xid` answers.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing is in flight or `xid` is not the oldest
    /// in-flight request.
    pub(crate) fn complete(&mut self, xid: Xid) -> Result<OutboundRequest, ProtocolError> {
        match self.sent.front() {
            Some(head) if head.xid == xid => self
                .sent
                .pop_front()
                .ok_or(ProtocolError::UnsolicitedReply(xid.as_i32())),
            Some(head) => Err(ProtocolError::UnexpectedXid {
                expected: head.xid.as_i32(),
                got: xid.as_i32(),
            }),
            None => Err(ProtocolError::UnsolicitedReply(xid.as_i32())),
        }
    }

    /// Takes every request that was sent but not answered.
    pub(crate) fn take_in_flight(&mut self) -> VecDeque<OutboundRequest> {
        std::mem::take(&mut self.sent)
    }

    /// Ends the epoch. A request caught mid-write was never fully sent and
    /// goes back to the head of the pending queue; engine traffic from the
    /// old epoch is dropped.
    pub(crate) fn end_epoch(&mut self) {
        debug_assert!(self.sent.is_empty());
        if let Some(cursor) = self.writing.take()
            && let Some(request) = cursor.request
        {
            self.pending.push_front(request);
        }
        self.pending.retain(|r| !r.internal);
    }

    /// Takes everything still owned, oldest first.
    pub(crate) fn drain_all(&mut self) -> Vec<OutboundRequest> {
        let mut all: Vec<_> = self.sent.drain(..).collect();
        if let Some(request) = self.writing.take().and_then(|c| c.request) {
            all.push(request);
        }
        all.extend(self.pending.drain(..));
        all
    }
}
