//! Session handles.
//!
//! [`Session`] is the cooperative handle: the embedder owns the loop.
//!
//! ```ignore
//! let mut session = Session::start("zk1:2181,zk2:2181", SessionConfig::default(), None)?;
//! loop {
//!     let interest = session.interest()?;
//!     let readiness = my_poller.wait(interest.descriptor, interest.timeout_from(Instant::now()));
//!     session.process(readiness)?;
//!     session.drain_completions();
//! }
//! ```
//!
//! [`SessionHandle`] is a cheap clone that submits requests and asks for a
//! close from any thread. The threaded adaptor lives in
//! [`crate::runtime::threaded`].

mod delivery;
pub(crate) mod engine;
mod interest;
mod lifecycle;
pub(crate) mod mux;
pub(crate) mod request;
pub(crate) mod shared;
mod state;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use minstant::Instant;

use crate::config::{SessionConfig, SessionCredentials};
use crate::error::SessionError;
use crate::net::{Endpoint, HostList, TcpTransport, Transport};
use crate::proto::Xid;
use crate::sync::Timeout;

pub use delivery::Completion;
pub use interest::{Interest, Readiness};
pub use lifecycle::{CloseOrigin, CloseStatus, Phase, TeardownReport};
pub use request::{Reply, ReplyCallback, Request};
pub use state::{State, Transition};
pub use watch::{WatchKind, WatchRegistration, WatchTarget, WatchedEvent, Watcher};

use engine::Engine;
use shared::Shared;

/// Cooperative session: no internal threads.
///
/// Dropping a session without [`Session::close`] still runs the teardown and
/// delivers the resulting completions on the dropping thread.
pub struct Session<T: Transport = TcpTransport> {
    engine: Engine<T>,
    shared: Arc<Shared>,
}

impl Session<TcpTransport> {
    /// Parses `hosts` and prepares a TCP session. Nothing is connected until
    /// the first [`Session::interest`].
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidHosts`] if the host string is malformed or
    /// resolves to nothing.
    pub fn start(
        hosts: &str,
        config: SessionConfig,
        previous: Option<SessionCredentials>,
    ) -> Result<Self, SessionError> {
        let hosts = HostList::parse(hosts, config.host_order)?;
        let transport = TcpTransport::new(config.tcp_nodelay);
        Ok(Self::with_transport(hosts, config, previous, transport))
    }
}

impl<T: Transport> Session<T> {
    #[must_use]
    pub fn with_transport(
        hosts: HostList,
        config: SessionConfig,
        previous: Option<SessionCredentials>,
        transport: T,
    ) -> Self {
        let shared = Shared::new();
        let engine = Engine::new(config, hosts, previous, transport, Arc::clone(&shared));
        Self { engine, shared }
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queues a request. The sink runs once with the outcome when
    /// completions are drained.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] after close or expiry,
    /// [`SessionError::Closing`] while a close is in progress.
    pub fn submit(
        &self,
        request: Request,
        sink: Option<ReplyCallback>,
    ) -> Result<Xid, SessionError> {
        self.shared.submit(request, sink)
    }

    /// What to wait for before the next [`Session::process`].
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] once the session is closed or expired.
    pub fn interest(&mut self) -> Result<Interest, SessionError> {
        self.engine.interest(Instant::now())
    }

    /// [`Session::interest`] against an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`Session::interest`].
    pub fn interest_at(&mut self, now: Instant) -> Result<Interest, SessionError> {
        self.engine.interest(now)
    }

    /// Performs the I/O `readiness` allows and reports a state change.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] once the session is closed or expired.
    pub fn process(&mut self, readiness: Readiness) -> Result<Option<Transition>, SessionError> {
        self.engine.process(readiness, Instant::now())
    }

    /// [`Session::process`] against an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`Session::process`].
    pub fn process_at(
        &mut self,
        readiness: Readiness,
        now: Instant,
    ) -> Result<Option<Transition>, SessionError> {
        self.engine.process(readiness, now)
    }

    /// Delivers every queued completion on this thread, returning how many
    /// ran.
    pub fn drain_completions(&self) -> usize {
        let mut delivered = 0;
        while let Some(item) = self.shared.completions.pop() {
            item.deliver();
            delivered += 1;
        }
        delivered
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.engine.state()
    }

    #[must_use]
    pub fn session_id(&self) -> i64 {
        self.engine.credentials().session_id
    }

    /// Credentials to persist for resuming the session later.
    #[must_use]
    pub fn credentials(&self) -> &SessionCredentials {
        self.engine.credentials()
    }

    #[must_use]
    pub fn negotiated_timeout(&self) -> Duration {
        self.engine.negotiated_timeout()
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.engine.endpoint()
    }

    #[must_use]
    pub fn last_zxid(&self) -> i64 {
        self.engine.last_zxid()
    }

    /// Replaces the default watcher, returning the previous one.
    pub fn set_default_watcher(
        &self,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Option<Arc<dyn Watcher>> {
        self.shared.set_default_watcher(watcher)
    }

    /// Closes the session and delivers the final completions here.
    pub fn close(mut self) -> CloseStatus {
        let status = self.shutdown();
        self.drain_completions();
        status
    }

    fn shutdown(&mut self) -> CloseStatus {
        if let Some(report) = self.engine.teardown(CloseOrigin::Caller) {
            return CloseStatus::Closed(report);
        }
        // A close asked for through a handle already ran on a loop turn.
        match self.engine.take_report() {
            Some(report) if report.origin == CloseOrigin::Caller => CloseStatus::Closed(report),
            _ => CloseStatus::AlreadyClosed,
        }
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.engine.teardown(CloseOrigin::Caller);
        self.drain_completions();
    }
}

/// Cloneable, thread-safe access to a session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub(crate) const fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Queues a request; see [`Session::submit`].
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] after close or expiry,
    /// [`SessionError::Closing`] while a close is in progress.
    pub fn submit(
        &self,
        request: Request,
        sink: Option<ReplyCallback>,
    ) -> Result<Xid, SessionError> {
        self.shared.submit(request, sink)
    }

    /// Queues a request with a closure sink.
    ///
    /// # Errors
    ///
    /// See [`SessionHandle::submit`].
    pub fn submit_with<F>(&self, request: Request, sink: F) -> Result<Xid, SessionError>
    where
        F: FnOnce(Result<Reply, SessionError>) + Send + 'static,
    {
        self.shared.submit(request, Some(Box::new(sink)))
    }

    /// Submits and blocks until the reply is delivered.
    ///
    /// Needs someone else to drive the session and deliver completions, so
    /// it is for threaded sessions. Never call it from a watcher or a reply
    /// sink: delivery would wait on itself.
    ///
    /// # Errors
    ///
    /// The request's own failure, [`SessionError::Timeout`] if `timeout`
    /// passes first (the request still completes later), or
    /// [`SessionError::Closing`] if the sink was dropped undelivered.
    pub fn call(&self, request: Request, timeout: Timeout) -> Result<Reply, SessionError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit_with(request, move |result| {
            let _ = tx.send(result);
        })?;
        match timeout {
            Timeout::Infinite => rx.recv().map_err(|_| SessionError::Closing)?,
            Timeout::Duration(d) => match rx.recv_timeout(d) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(SessionError::Timeout),
                Err(RecvTimeoutError::Disconnected) => Err(SessionError::Closing),
            },
        }
    }

    /// Asks whoever drives the session to close it on its next turn.
    /// Returns `false` if a close was already asked for or the session is
    /// past open.
    pub fn request_close(&self) -> bool {
        self.shared.request_close()
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.shared.state()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.lifecycle.phase()
    }

    /// Server-assigned session id, `0` before the first handshake.
    #[must_use]
    pub fn session_id(&self) -> i64 {
        self.shared.session_id()
    }

    pub fn set_default_watcher(
        &self,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Option<Arc<dyn Watcher>> {
        self.shared.set_default_watcher(watcher)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}
