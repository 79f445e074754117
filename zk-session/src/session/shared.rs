//! State shared between the engine owner, caller handles and delivery.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::error::SessionError;
use crate::proto::Xid;
use crate::sync::CompletionQueue;
use crate::sync::submit::SubmitQueue;

use super::delivery::Completion;
use super::lifecycle::Lifecycle;
use super::request::{ReplyCallback, Request};
use super::state::{State, StateCell};
use super::watch::Watcher;

/// Nudges whoever runs the engine (the I/O thread's poller).
pub(crate) trait Wake: Send + Sync {
    fn wake(&self);
}

impl Wake for mio::Waker {
    fn wake(&self) {
        // Failure means the poller is gone; nobody is left to wake.
        let _ = mio::Waker::wake(self);
    }
}

pub(crate) struct Shared {
    pub(crate) submit: SubmitQueue,
    pub(crate) completions: CompletionQueue<Completion>,
    pub(crate) lifecycle: Lifecycle,
    state: StateCell,
    session_id: AtomicI64,
    default_watcher: Mutex<Option<Arc<dyn Watcher>>>,
    waker: OnceLock<Arc<dyn Wake>>,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            submit: SubmitQueue::new(),
            completions: CompletionQueue::new(),
            lifecycle: Lifecycle::new(),
            state: StateCell::new(State::Disconnected),
            session_id: AtomicI64::new(0),
            default_watcher: Mutex::new(None),
            waker: OnceLock::new(),
        })
    }

    pub(crate) fn state(&self) -> State {
        self.state.load()
    }

    pub(crate) fn publish_state(&self, state: State) {
        self.state.store(state);
    }

    pub(crate) fn session_id(&self) -> i64 {
        self.session_id.load(Ordering::Acquire)
    }

    pub(crate) fn publish_session_id(&self, id: i64) {
        self.session_id.store(id, Ordering::Release);
    }

    pub(crate) fn default_watcher(&self) -> Option<Arc<dyn Watcher>> {
        self.default_watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the default watcher, returning the previous one.
    pub(crate) fn set_default_watcher(
        &self,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Option<Arc<dyn Watcher>> {
        let mut slot = self
            .default_watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, watcher)
    }

    pub(crate) fn install_waker(&self, waker: Arc<dyn Wake>) {
        let _ = self.waker.set(waker);
    }

    pub(crate) fn wake(&self) {
        if let Some(waker) = self.waker.get() {
            waker.wake();
        }
    }

    pub(crate) fn submit(
        &self,
        request: Request,
        sink: Option<ReplyCallback>,
    ) -> Result<Xid, SessionError> {
        let Some(xid) = self.submit.push(request, sink) else {
            let state = self.state();
            return Err(if state.is_terminal() {
                SessionError::InvalidState(state)
            } else {
                SessionError::Closing
            });
        };
        self.wake();
        Ok(xid)
    }

    pub(crate) fn request_close(&self) -> bool {
        let first = self.lifecycle.request_close();
        self.wake();
        first
    }
}
