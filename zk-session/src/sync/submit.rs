//! Caller-side request intake.
//!
//! Any thread may submit; the engine drains the queue on its own schedule.
//! Xids are assigned under the same lock that orders the queue, so wire
//! order always matches xid order.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::proto::Xid;
use crate::session::request::{OutboundRequest, ReplyCallback, Request};

#[derive(Debug)]
struct Intake {
    queue: VecDeque<OutboundRequest>,
    next_xid: i32,
    accepting: bool,
}

impl Intake {
    fn allocate(&mut self) -> Xid {
        let xid = Xid::new(self.next_xid);
        self.next_xid = if self.next_xid == i32::MAX {
            1
        } else {
            self.next_xid + 1
        };
        xid
    }
}

#[derive(Debug)]
pub(crate) struct SubmitQueue {
    inner: Mutex<Intake>,
}

impl SubmitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            inner: Mutex::new(Intake {
                queue: VecDeque::new(),
                next_xid: 1,
                accepting: true,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Intake> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `request`. Returns `None` once the queue is closed; the sink
    /// is dropped without being called.
    pub(crate) fn push(&self, request: Request, sink: Option<ReplyCallback>) -> Option<Xid> {
        let mut intake = self.lock();
        if !intake.accepting {
            return None;
        }
        let xid = intake.allocate();
        intake
            .queue
            .push_back(OutboundRequest::caller(xid, request, sink));
        Some(xid)
    }

    /// Next xid for engine traffic that is correlated like a caller request.
    pub(crate) fn allocate_xid(&self) -> Xid {
        self.lock().allocate()
    }

    /// Moves every queued request to the back of `out`, in order.
    pub(crate) fn drain_into(&self, out: &mut VecDeque<OutboundRequest>) -> usize {
        let mut intake = self.lock();
        let n = intake.queue.len();
        out.extend(intake.queue.drain(..));
        n
    }

    /// Stops intake and returns whatever was still queued.
    pub(crate) fn close(&self) -> VecDeque<OutboundRequest> {
        let mut intake = self.lock();
        intake.accepting = false;
        std::mem::take(&mut intake.queue)
    }

    #[cfg(test)]
    pub(crate) fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::OpCode;

    fn req() -> Request {
        Request::new(OpCode::Sync, Vec::new())
    }

    #[test]
    fn xids_increase_in_queue_order() {
        let q = SubmitQueue::new();
        let a = q.push(req(), None).unwrap();
        let b = q.push(req(), None).unwrap();
        let c = q.allocate_xid();
        assert!(a < b && b < c);

        let mut out = VecDeque::new();
        assert_eq!(q.drain_into(&mut out), 2);
        let xids: Vec<_> = out.iter().map(|r| r.xid).collect();
        assert_eq!(xids, vec![a, b]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn closed_queue_rejects_and_returns_leftovers() {
        let q = SubmitQueue::new();
        q.push(req(), None).unwrap();
        let leftovers = q.close();
        assert_eq!(leftovers.len(), 1);
        assert!(!q.is_accepting());
        assert!(q.push(req(), None).is_none());
    }

    #[test]
    fn xid_wraps_to_one() {
        let q = SubmitQueue::new();
        q.lock().next_xid = i32::MAX;
        assert_eq!(q.allocate_xid(), Xid::new(i32::MAX));
        assert_eq!(q.allocate_xid(), Xid::new(1));
    }
}
