//! Items on the completion queue.

use std::fmt;
use std::sync::Arc;

use crate::error::SessionError;
use crate::proto::Xid;

use super::request::{Reply, ReplyCallback};
use super::watch::{WatchedEvent, Watcher};

/// One unit of work for the delivery context.
///
/// Produced by the engine, consumed in order by whoever drains the
/// completion queue. Delivery runs user code and must not hold engine locks.
pub enum Completion {
    /// Outcome of a caller request.
    Reply {
        xid: Xid,
        sink: Option<ReplyCallback>,
        result: Result<Reply, SessionError>,
    },
    /// A fired node watch.
    Watch {
        event: WatchedEvent,
        watchers: Vec<Arc<dyn Watcher>>,
    },
    /// A session state change.
    StateChange {
        event: WatchedEvent,
        watchers: Vec<Arc<dyn Watcher>>,
    },
}

impl Completion {
    /// Runs the sink or watchers for this item.
    pub fn deliver(self) {
        match self {
            Self::Reply { sink, result, .. } => {
                if let Some(sink) = sink {
                    sink(result);
                }
            }
            Self::Watch { event, watchers } | Self::StateChange { event, watchers } => {
                for watcher in watchers {
                    watcher.process(&event);
                }
            }
        }
    }

    /// Xid of a reply item.
    #[must_use]
    pub const fn xid(&self) -> Option<Xid> {
        match self {
            Self::Reply { xid, .. } => Some(*xid),
            Self::Watch { .. } | Self::StateChange { .. } => None,
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reply { xid, sink, result } => f
                .debug_struct("Reply")
                .field("xid", xid)
                .field("has_sink", &sink.is_some())
                .field("result", result)
                .finish(),
            Self::Watch { event, watchers } => f
                .debug_struct("Watch")
                .field("event", event)
                .field("watchers", &watchers.len())
                .finish(),
            Self::StateChange { event, watchers } => f
                .debug_struct("StateChange")
                .field("event", event)
                .field("watchers", &watchers.len())
                .finish(),
        }
    }
}
