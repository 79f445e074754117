//! Watch registration and event routing.
//!
//! A watch is armed by a read request (`exists`, `getData`, `getChildren`)
//! and becomes active only when the server accepts that request. Active
//! watches live in three tables keyed by path; an inbound event removes and
//! returns every watcher interested in it. Watches are one-shot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::proto::{ErrorCode, EventType, KeeperState, SetWatches, WatcherEvent};

/// Receiver of watch and session-state notifications.
///
/// Called on the delivery context (the completion thread in threaded mode).
pub trait Watcher: Send + Sync {
    fn process(&self, event: &WatchedEvent);
}

impl<F> Watcher for F
where
    F: Fn(&WatchedEvent) + Send + Sync,
{
    fn process(&self, event: &WatchedEvent) {
        self(event);
    }
}

/// Event handed to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub state: KeeperState,
    /// Node path; `None` for session-state events.
    pub path: Option<String>,
}

impl WatchedEvent {
    #[must_use]
    pub const fn session(state: KeeperState) -> Self {
        Self {
            event_type: EventType::Session,
            state,
            path: None,
        }
    }
}

impl From<WatcherEvent> for WatchedEvent {
    fn from(event: WatcherEvent) -> Self {
        let path = (event.event_type != EventType::Session).then_some(event.path);
        Self {
            event_type: event.event_type,
            state: event.state,
            path,
        }
    }
}

/// Who gets notified when a watch fires.
#[derive(Clone)]
pub enum WatchTarget {
    /// The session's default watcher, resolved when the event fires.
    Default,
    Custom(Arc<dyn Watcher>),
}

impl PartialEq for WatchTarget {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Default, Self::Default) => true,
            (Self::Custom(a), Self::Custom(b)) => same_watcher(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Custom(w) => write!(f, "Custom({:p})", Arc::as_ptr(w).cast::<()>()),
        }
    }
}

fn same_watcher(a: &Arc<dyn Watcher>, b: &Arc<dyn Watcher>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// Read operation a watch was requested on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Exists,
    Data,
    Child,
}

/// Watch carried by a request until its reply arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRegistration {
    pub path: String,
    pub kind: WatchKind,
    pub target: WatchTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Data,
    Exist,
    Child,
}

impl WatchRegistration {
    /// Table the watch lands in for a reply with `err`, if any.
    ///
    /// An `exists` on a missing node still arms a creation watch.
    fn table_for(&self, err: ErrorCode) -> Option<Table> {
        match (self.kind, err) {
            (WatchKind::Exists | WatchKind::Data, ErrorCode::Ok) => Some(Table::Data),
            (WatchKind::Exists, ErrorCode::NoNode) => Some(Table::Exist),
            (WatchKind::Child, ErrorCode::Ok) => Some(Table::Child),
            _ => None,
        }
    }
}

/// Active watches of one session.
#[derive(Debug, Default)]
pub(crate) struct WatcherSet {
    data: BTreeMap<String, Vec<WatchTarget>>,
    exist: BTreeMap<String, Vec<WatchTarget>>,
    child: BTreeMap<String, Vec<WatchTarget>>,
}

impl WatcherSet {
    fn table(&mut self, table: Table) -> &mut BTreeMap<String, Vec<WatchTarget>> {
        match table {
            Table::Data => &mut self.data,
            Table::Exist => &mut self.exist,
            Table::Child => &mut self.child,
        }
    }

    /// Activates `reg` if the reply code allows it. Returns whether a watch
    /// was added.
    ///
    /// Duplicates are per (path, table, target): distinct watchers on one
    /// path are all kept and each fires once.
    pub(crate) fn register(&mut self, reg: WatchRegistration, err: ErrorCode) -> bool {
        let Some(table) = reg.table_for(err) else {
            return false;
        };
        let targets = self.table(table).entry(reg.path).or_default();
        if targets.contains(&reg.target) {
            return false;
        }
        targets.push(reg.target);
        true
    }

    /// Removes and returns the watchers a node event fires.
    pub(crate) fn take_for(&mut self, event_type: EventType, path: &str) -> Vec<WatchTarget> {
        let tables: &[Table] = match event_type {
            EventType::NodeCreated | EventType::NodeDataChanged => &[Table::Data, Table::Exist],
            EventType::NodeDeleted => &[Table::Data, Table::Exist, Table::Child],
            EventType::NodeChildrenChanged => &[Table::Child],
            EventType::Session | EventType::Other(_) => &[],
        };
        let mut fired = Vec::new();
        for &table in tables {
            for target in self.table(table).remove(path).into_iter().flatten() {
                push_unique(&mut fired, target);
            }
        }
        fired
    }

    /// Every registered watcher, each once.
    pub(crate) fn all_targets(&self) -> Vec<WatchTarget> {
        let mut all = Vec::new();
        for targets in self.data.values().chain(self.exist.values()).chain(self.child.values()) {
            for target in targets {
                push_unique(&mut all, target.clone());
            }
        }
        all
    }

    /// Snapshot for re-registration on a fresh connection.
    pub(crate) fn to_set_watches(&self, relative_zxid: i64) -> SetWatches {
        SetWatches {
            relative_zxid,
            data: self.data.keys().cloned().collect(),
            exist: self.exist.keys().cloned().collect(),
            child: self.child.keys().cloned().collect(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty() && self.exist.is_empty() && self.child.is_empty()
    }

    /// Number of (path, watcher) pairs.
    pub(crate) fn len(&self) -> usize {
        [&self.data, &self.exist, &self.child]
            .into_iter()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum()
    }
}

fn push_unique(out: &mut Vec<WatchTarget>, target: WatchTarget) {
    if !out.contains(&target) {
        out.push(target);
    }
}

/// Turns targets into concrete watchers. The default is looked up now, so a
/// watcher replaced after registration still receives the event. Duplicates
/// collapse to one delivery.
pub(crate) fn resolve(
    targets: Vec<WatchTarget>,
    default: Option<&Arc<dyn Watcher>>,
) -> Vec<Arc<dyn Watcher>> {
    let mut out: Vec<Arc<dyn Watcher>> = Vec::with_capacity(targets.len());
    for target in targets {
        let watcher = match target {
            WatchTarget::Default => match default {
                Some(w) => Arc::clone(w),
                None => continue,
            },
            WatchTarget::Custom(w) => w,
        };
        if !out.iter().any(|seen| same_watcher(seen, &watcher)) {
            out.push(watcher);
        }
    }
    out
}
