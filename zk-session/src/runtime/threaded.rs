//! Threaded adaptor: the engine on its own I/O thread.
//!
//! # Threads
//!
//! - **`zk-io`**: owns the [`Engine`] and a `mio::Poll`. Loops
//!   `interest` → `poll` → `process`. Submissions and close requests wake it
//!   through a `mio::Waker`.
//! - **`zk-completion`**: blocks on the completion queue and delivers replies
//!   and watch events in order.
//!
//! The two threads share only the submit queue, the completion queue and
//! the lifecycle atomics.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use minstant::Instant;
use mio::unix::SourceFd;
use mio::{Events, Interest as MioInterest, Poll, Token, Waker};

use crate::config::{SessionConfig, SessionCredentials};
use crate::error::SessionError;
use crate::net::{HostList, TcpTransport, Transport};
use crate::proto::Xid;
use crate::session::engine::Engine;
use crate::session::shared::Shared;
use crate::session::{
    CloseOrigin, CloseStatus, Interest, Readiness, Reply, ReplyCallback, Request, SessionHandle,
    State, TeardownReport, Watcher,
};
use crate::sync::Timeout;
use crate::trace::{debug, error, info, trace, warn};

const WAKE: Token = Token(0);
const CONNECTION: Token = Token(1);

const EVENT_CAPACITY: usize = 16;

struct IoWorker<T: Transport> {
    engine: Engine<T>,
    poll: Poll,
    events: Events,
    /// Descriptor and epoch currently registered with the poller.
    registered: Option<(RawFd, u64)>,
}

impl<T: Transport> IoWorker<T> {
    fn run(mut self) -> Option<TeardownReport> {
        loop {
            let Ok(interest) = self.engine.interest(Instant::now()) else {
                break;
            };
            self.sync_registration(&interest);

            let timeout = interest.timeout_from(Instant::now());
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed; closing session");
                self.engine.teardown(CloseOrigin::Caller);
                break;
            }

            let mut readiness = Readiness::NONE;
            for event in &self.events {
                match event.token() {
                    CONNECTION => {
                        readiness.readable |= event.is_readable() || event.is_read_closed();
                        readiness.writable |= event.is_writable();
                        readiness.error |= event.is_error() || event.is_write_closed();
                    }
                    WAKE => trace!("woken"),
                    _ => {}
                }
            }
            if self.engine.process(readiness, Instant::now()).is_err() {
                break;
            }
        }
        self.deregister();
        self.engine.take_report()
    }

    /// Keeps the poller registration in step with the engine's socket.
    ///
    /// Re-registers every turn: mio is edge-triggered, so a write interest
    /// that did not change still has to be re-armed to fire again.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn sync_registration(&mut self, interest: &Interest) {
        let wanted = match (interest.readable, interest.writable) {
            (true, true) => Some(MioInterest::READABLE | MioInterest::WRITABLE),
            (true, false) => Some(MioInterest::READABLE),
            (false, true) => Some(MioInterest::WRITABLE),
            (false, false) => None,
        };
        let current = interest.descriptor.map(|fd| (fd, self.engine.epoch()));

        if self.registered.is_some() && self.registered != current {
            self.deregister();
        }
        let (Some((fd, epoch)), Some(wanted)) = (current, wanted) else {
            return;
        };
        let registry = self.poll.registry();
        let result = if self.registered.is_some() {
            registry.reregister(&mut SourceFd(&fd), CONNECTION, wanted)
        } else {
            registry.register(&mut SourceFd(&fd), CONNECTION, wanted)
        };
        match result {
            Ok(()) => self.registered = Some((fd, epoch)),
            Err(e) => warn!(fd, epoch, error = %e, "cannot register socket with poller"),
        }
    }

    fn deregister(&mut self) {
        if let Some((fd, _)) = self.registered.take() {
            // The socket may already be closed, which removes it from epoll.
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables, unused_assignments))]
fn deliver_loop(shared: &Shared) {
    let mut delivered = 0u64;
    while let Some(item) = shared.completions.pop_blocking(Timeout::Infinite) {
        item.deliver();
        delivered += 1;
    }
    debug!(delivered, "completion queue finished");
}

/// A session driven by its own I/O and delivery threads.
///
/// Dropping it closes the session and joins both threads.
pub struct ThreadedSession {
    shared: Arc<Shared>,
    io: Option<JoinHandle<Option<TeardownReport>>>,
    delivery: Option<JoinHandle<()>>,
}

impl ThreadedSession {
    /// Parses `hosts` and starts connecting on a new I/O thread.
    ///
    /// `watcher` becomes the default watcher before any I/O happens, so it
    /// sees the first connected event.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidHosts`] for a bad host string and
    /// [`SessionError::Resource`] if the poller or a thread cannot be created.
    pub fn start(
        hosts: &str,
        config: SessionConfig,
        previous: Option<SessionCredentials>,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Self, SessionError> {
        let hosts = HostList::parse(hosts, config.host_order)?;
        let transport = TcpTransport::new(config.tcp_nodelay);
        Self::with_transport(hosts, config, previous, watcher, transport)
    }

    /// Starts a session over any transport whose descriptor mio can poll.
    ///
    /// # Errors
    ///
    /// [`SessionError::Resource`] if the poller or a thread cannot be created.
    pub fn with_transport<T: Transport + 'static>(
        hosts: HostList,
        config: SessionConfig,
        previous: Option<SessionCredentials>,
        watcher: Option<Arc<dyn Watcher>>,
        transport: T,
    ) -> Result<Self, SessionError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE)?;

        let shared = Shared::new();
        shared.install_waker(Arc::new(waker));
        shared.set_default_watcher(watcher);

        info!(hosts = hosts.len(), timeout = ?config.session_timeout, "starting threaded session");
        let worker = IoWorker {
            engine: Engine::new(config, hosts, previous, transport, Arc::clone(&shared)),
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            registered: None,
        };

        let io = thread::Builder::new().name("zk-io".into()).spawn(move || {
            debug!("I/O thread started");
            let report = worker.run();
            debug!("I/O thread exiting");
            report
        })?;

        let delivery_shared = Arc::clone(&shared);
        let delivery = match thread::Builder::new()
            .name("zk-completion".into())
            .spawn(move || deliver_loop(&delivery_shared))
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "failed to spawn completion thread");
                shared.request_close();
                let _ = io.join();
                // Nobody will deliver; run what teardown queued here.
                while let Some(item) = shared.completions.pop() {
                    item.deliver();
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            shared,
            io: Some(io),
            delivery: Some(delivery),
        })
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(Arc::clone(&self.shared))
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.shared.state()
    }

    #[must_use]
    pub fn session_id(&self) -> i64 {
        self.shared.session_id()
    }

    /// Queues a request; the sink runs on the completion thread.
    ///
    /// # Errors
    ///
    /// See [`SessionHandle::submit`].
    pub fn submit(
        &self,
        request: Request,
        sink: Option<ReplyCallback>,
    ) -> Result<Xid, SessionError> {
        self.shared.submit(request, sink)
    }

    /// Submits and waits for the reply; see [`SessionHandle::call`].
    ///
    /// # Errors
    ///
    /// See [`SessionHandle::call`].
    pub fn call(&self, request: Request, timeout: Timeout) -> Result<Reply, SessionError> {
        self.handle().call(request, timeout)
    }

    /// Closes the session and joins both workers.
    ///
    /// Returns [`CloseStatus::AlreadyClosed`] if the session had already
    /// expired. A worker never joins itself: called from the completion
    /// thread (a watcher owning the session) or from the I/O thread (the
    /// last owner dropped by teardown), that thread exits on its own.
    pub fn close(mut self) -> CloseStatus {
        self.shutdown()
    }

    fn shutdown(&mut self) -> CloseStatus {
        self.shared.request_close();
        let current = thread::current().id();
        let mut joined = 0;
        let mut report = None;

        if let Some(io) = self.io.take() {
            if io.thread().id() == current {
                // The last owner was a watcher released during teardown.
                debug!("close issued from the I/O thread; not joining it");
            } else {
                match io.join() {
                    Ok(r) => {
                        report = r;
                        joined += 1;
                    }
                    Err(_) => {
                        error!("I/O thread panicked");
                        self.shared.completions.finish();
                    }
                }
            }
        }
        if let Some(delivery) = self.delivery.take() {
            if delivery.thread().id() == current {
                debug!("close issued from the completion thread; not joining it");
            } else if delivery.join().is_ok() {
                joined += 1;
            } else {
                error!("completion thread panicked");
            }
        }

        match report {
            Some(mut report) if report.origin == CloseOrigin::Caller => {
                report.workers_joined = joined;
                info!(report = ?report, "threaded session closed");
                CloseStatus::Closed(report)
            }
            _ => {
                debug!(workers_joined = joined, "session had already ended");
                CloseStatus::AlreadyClosed
            }
        }
    }
}

impl Drop for ThreadedSession {
    fn drop(&mut self) {
        if self.io.is_some() || self.delivery.is_some() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for ThreadedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedSession")
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}
