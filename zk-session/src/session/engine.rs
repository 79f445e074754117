//! The connection state machine.
//!
//! [`Engine`] owns the transport, the host list, the multiplexer and the
//! watcher set. It never blocks and never spawns: an embedder asks for
//! [`Interest`], waits on the descriptor, and hands back [`Readiness`]. The
//! threaded adaptor is one such embedder.
//!
//! # Epochs
//!
//! Every connect attempt starts a new epoch. When an epoch ends, requests
//! that were sent on it fail with connection loss; requests that were never
//! fully written move to the next epoch unchanged. Durable watches survive
//! and are re-armed right after the next handshake.

use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;

use crate::config::{SessionConfig, SessionCredentials};
use crate::error::SessionError;
use crate::net::{Endpoint, HostList, Transport};
use crate::proto::{
    ConnectRequest, ConnectResponse, EventType, FrameAssembler, KeeperState, OpCode,
    PASSWORD_LEN, PROTOCOL_VERSION, ProtocolError, ReplyHeader, WatcherEvent, Xid,
};
use crate::trace::{debug, info, trace, warn};

use super::delivery::Completion;
use super::interest::{Interest, Readiness};
use super::lifecycle::{CloseOrigin, TeardownReport};
use super::mux::{FlushOutcome, Multiplexer};
use super::request::{OutboundRequest, Reply};
use super::shared::Shared;
use super::state::{State, Transition};
use super::watch::{WatchTarget, WatchedEvent, WatcherSet, resolve};

/// Why a connection epoch ended.
#[derive(Debug)]
#[cfg_attr(not(feature = "tracing"), allow(dead_code))]
enum Loss {
    ConnectTimeout,
    HandshakeTimeout,
    /// Nothing received for the whole negotiated timeout.
    Silent,
    PeerClosed,
    Hangup,
    Io(io::Error),
    Protocol(ProtocolError),
}

pub(crate) struct Engine<T: Transport> {
    config: SessionConfig,
    shared: Arc<Shared>,
    transport: T,
    hosts: HostList,
    watches: WatcherSet,
    mux: Multiplexer,
    inbound: FrameAssembler,
    read_buf: Vec<u8>,
    state: State,
    epoch: u64,
    endpoint: Option<Endpoint>,
    credentials: SessionCredentials,
    connect_timeout: Duration,
    negotiated: Duration,
    last_zxid: i64,
    connect_started: Instant,
    last_send: Instant,
    last_recv: Instant,
    /// Backoff gate after a full cycle of failed hosts.
    retry_at: Option<Instant>,
    ping_outstanding: bool,
    report: Option<TeardownReport>,
}

impl<T: Transport> Engine<T> {
    pub(crate) fn new(
        config: SessionConfig,
        hosts: HostList,
        previous: Option<SessionCredentials>,
        transport: T,
        shared: Arc<Shared>,
    ) -> Self {
        let now = Instant::now();
        let credentials = previous.unwrap_or_default();
        shared.publish_session_id(credentials.session_id);
        shared.publish_state(State::Disconnected);
        Self {
            connect_timeout: config.connect_timeout_for(hosts.len()),
            negotiated: config.session_timeout,
            inbound: FrameAssembler::new(config.max_frame_len),
            read_buf: vec![0; config.read_chunk.max(1)],
            config,
            shared,
            transport,
            hosts,
            watches: WatcherSet::default(),
            mux: Multiplexer::default(),
            state: State::Disconnected,
            epoch: 0,
            endpoint: None,
            credentials,
            last_zxid: 0,
            connect_started: now,
            last_send: now,
            last_recv: now,
            retry_at: None,
            ping_outstanding: false,
            report: None,
        }
    }

    pub(crate) const fn state(&self) -> State {
        self.state
    }

    pub(crate) const fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) const fn credentials(&self) -> &SessionCredentials {
        &self.credentials
    }

    pub(crate) const fn negotiated_timeout(&self) -> Duration {
        self.negotiated
    }

    pub(crate) const fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub(crate) const fn last_zxid(&self) -> i64 {
        self.last_zxid
    }

    pub(crate) fn take_report(&mut self) -> Option<TeardownReport> {
        self.report.take()
    }

    /// Runs timers, starts a connect if due, and reports what to wait for.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] once the session is closed or expired.
    /// A pending close request is carried out here first.
    pub(crate) fn interest(&mut self, now: Instant) -> Result<Interest, SessionError> {
        self.ensure_live()?;
        self.mux.pull(&self.shared.submit);
        self.run_timers(now);
        if self.state == State::Disconnected {
            self.try_connect(now);
        }
        if self.state.is_terminal() {
            return Err(SessionError::InvalidState(self.state));
        }

        let descriptor = self.transport.descriptor();
        let (readable, writable) = match self.state {
            State::Connecting => (true, true),
            State::Associating | State::Connected => {
                (true, self.mux.has_output(self.state == State::Connected))
            }
            State::Disconnected | State::Closed | State::Expired => (false, false),
        };
        Ok(Interest {
            descriptor,
            readable: readable && descriptor.is_some(),
            writable: writable && descriptor.is_some(),
            deadline: self.next_deadline(now),
        })
    }

    /// Performs the I/O the current state calls for.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] once the session is closed or expired.
    pub(crate) fn process(
        &mut self,
        readiness: Readiness,
        now: Instant,
    ) -> Result<Option<Transition>, SessionError> {
        self.ensure_live()?;
        let from = self.state;
        self.mux.pull(&self.shared.submit);

        match self.state {
            State::Connecting if !readiness.is_empty() => self.finish_connect(now),
            State::Associating | State::Connected => self.exchange(readiness, now),
            _ => {}
        }
        if !self.state.is_terminal() {
            self.run_timers(now);
        }

        Ok((self.state != from).then_some(Transition {
            from,
            to: self.state,
        }))
    }

    fn ensure_live(&mut self) -> Result<(), SessionError> {
        if !self.state.is_terminal() && self.shared.lifecycle.close_requested() {
            self.teardown(CloseOrigin::Caller);
        }
        if self.state.is_terminal() {
            return Err(SessionError::InvalidState(self.state));
        }
        Ok(())
    }

    fn next_deadline(&self, now: Instant) -> Instant {
        match self.state {
            State::Disconnected => self.retry_at.unwrap_or(now),
            State::Connecting => self.connect_started + self.connect_timeout,
            State::Associating => self.last_recv + self.connect_timeout,
            State::Connected => {
                let dead = self.last_recv + self.negotiated;
                if self.ping_outstanding {
                    dead
                } else {
                    dead.min(self.last_send + self.ping_interval())
                }
            }
            State::Closed | State::Expired => now,
        }
    }

    fn ping_interval(&self) -> Duration {
        self.negotiated / 3
    }

    fn run_timers(&mut self, now: Instant) {
        match self.state {
            State::Connecting if now >= self.connect_started + self.connect_timeout => {
                self.lose_connection(Loss::ConnectTimeout, now);
            }
            State::Associating if now >= self.last_recv + self.connect_timeout => {
                self.lose_connection(Loss::HandshakeTimeout, now);
            }
            State::Connected => {
                if now >= self.last_recv + self.negotiated {
                    self.lose_connection(Loss::Silent, now);
                } else if !self.ping_outstanding && now >= self.last_send + self.ping_interval() {
                    trace!(epoch = self.epoch, "queueing ping");
                    self.mux
                        .push_back(OutboundRequest::internal(Xid::PING, OpCode::Ping, Vec::new()));
                    self.ping_outstanding = true;
                }
            }
            _ => {}
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(from = %self.state, to = %state, epoch = self.epoch, "state transition");
            self.state = state;
            self.shared.publish_state(state);
        }
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn try_connect(&mut self, now: Instant) {
        if let Some(at) = self.retry_at {
            if now < at {
                return;
            }
            self.retry_at = None;
        }
        let Some(endpoint) = self.hosts.next_endpoint() else {
            return;
        };
        self.epoch += 1;
        self.inbound.clear();
        match self.transport.connect(&endpoint) {
            Ok(()) => {
                debug!(endpoint = %endpoint, epoch = self.epoch, "connecting");
                self.endpoint = Some(endpoint);
                self.connect_started = now;
                self.set_state(State::Connecting);
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "connect failed immediately");
                self.transport.shutdown();
                self.note_failure(now);
            }
        }
    }

    fn note_failure(&mut self, now: Instant) {
        if self.hosts.record_failure() {
            debug!(backoff = ?self.config.reconnect_backoff, "every host failed; backing off");
            self.retry_at = Some(now + self.config.reconnect_backoff);
        }
    }

    fn finish_connect(&mut self, now: Instant) {
        match self.transport.finish_connect() {
            Ok(true) => self.start_handshake(now),
            Ok(false) => {}
            Err(e) => self.lose_connection(Loss::Io(e), now),
        }
    }

    fn start_handshake(&mut self, now: Instant) {
        let password = if self.credentials.is_established() {
            self.credentials.password.clone()
        } else {
            vec![0; PASSWORD_LEN]
        };
        let request = ConnectRequest {
            protocol_version: PROTOCOL_VERSION,
            last_zxid_seen: self.last_zxid,
            timeout_ms: self.config.timeout_ms(),
            session_id: self.credentials.session_id,
            password,
        };
        let frame = match request.encode() {
            Ok(frame) => frame,
            Err(e) => return self.lose_connection(Loss::Protocol(e), now),
        };
        self.mux.begin_epoch(frame);
        self.last_recv = now;
        self.last_send = now;
        self.set_state(State::Associating);
        self.flush(now);
    }

    fn exchange(&mut self, readiness: Readiness, now: Instant) {
        let epoch = self.epoch;
        if readiness.readable || readiness.error {
            self.read_available(now);
        }
        if self.epoch != epoch {
            return;
        }
        if readiness.error && !self.state.is_terminal() {
            return self.lose_connection(Loss::Hangup, now);
        }
        if matches!(self.state, State::Associating | State::Connected) {
            self.flush(now);
        }
    }

    fn read_available(&mut self, now: Instant) {
        let epoch = self.epoch;
        let mut failure = None;
        loop {
            match self.transport.recv(&mut self.read_buf) {
                Ok(0) => {
                    failure = Some(Loss::PeerClosed);
                    break;
                }
                Ok(n) => {
                    self.inbound.extend(&self.read_buf[..n]);
                    self.last_recv = now;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    failure = Some(Loss::Io(e));
                    break;
                }
            }
        }
        // Frames that arrived before the failure still count (a denied
        // handshake is usually followed by the server closing).
        self.dispatch_frames(now);
        if let Some(reason) = failure
            && self.epoch == epoch
            && !self.state.is_terminal()
        {
            self.lose_connection(reason, now);
        }
    }

    fn dispatch_frames(&mut self, now: Instant) {
        let epoch = self.epoch;
        while self.epoch == epoch && matches!(self.state, State::Associating | State::Connected) {
            let body = match self.inbound.next_frame() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => return self.lose_connection(Loss::Protocol(e), now),
            };
            let handled = if self.state == State::Associating {
                self.on_handshake(&body, now)
            } else {
                self.on_frame(&body)
            };
            if let Err(e) = handled {
                return self.lose_connection(Loss::Protocol(e), now);
            }
        }
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn on_handshake(&mut self, body: &[u8], now: Instant) -> Result<(), ProtocolError> {
        let response = ConnectResponse::decode(body)?;
        let resumed = self.credentials.session_id;
        if !response.is_granted() || (resumed != 0 && response.session_id != resumed) {
            warn!(
                session_id = resumed,
                timeout_ms = response.timeout_ms,
                "server refused session"
            );
            self.teardown(CloseOrigin::Expiry);
            return Ok(());
        }

        self.credentials = SessionCredentials {
            session_id: response.session_id,
            password: response.password,
        };
        self.negotiated = Duration::from_millis(u64::try_from(response.timeout_ms).unwrap_or(1));
        self.shared.publish_session_id(response.session_id);
        self.hosts.record_success();
        self.last_recv = now;
        self.last_send = now;
        self.ping_outstanding = false;

        if !self.watches.is_empty() {
            match self.watches.to_set_watches(self.last_zxid).to_payload() {
                Ok(payload) => {
                    debug!(watches = self.watches.len(), "re-arming watches");
                    self.mux.push_front(OutboundRequest::internal(
                        Xid::SET_WATCHES,
                        OpCode::SetWatches,
                        payload,
                    ));
                }
                Err(e) => warn!(error = %e, "cannot encode watch re-registration"),
            }
        }

        self.set_state(State::Connected);
        info!(
            session_id = format_args!("{:#x}", response.session_id),
            timeout_ms = response.timeout_ms,
            endpoint = ?self.endpoint,
            "session established"
        );
        self.notify_state(KeeperState::SyncConnected);
        Ok(())
    }

    fn on_frame(&mut self, body: &[u8]) -> Result<(), ProtocolError> {
        let (header, payload) = ReplyHeader::decode(body)?;
        if header.zxid > 0 {
            self.last_zxid = self.last_zxid.max(header.zxid);
        }
        match header.xid {
            Xid::WATCHER_EVENT => self.on_watch_event(WatcherEvent::decode(payload)?),
            Xid::PING => {
                trace!("ping reply");
                self.ping_outstanding = false;
            }
            Xid::SET_WATCHES => debug!(err = %header.err, "watches re-armed"),
            xid if xid.is_reserved() => debug!(xid = %xid, "ignoring reply to reserved xid"),
            xid => {
                let request = self.mux.complete(xid)?;
                if let Some(reg) = request.watch
                    && self.watches.register(reg, header.err)
                {
                    trace!(xid = %xid, "watch armed");
                }
                trace!(xid = %xid, err = %header.err, "reply");
                self.emit(Completion::Reply {
                    xid,
                    sink: request.sink,
                    result: Ok(Reply {
                        xid,
                        zxid: header.zxid,
                        err: header.err,
                        payload: payload.to_vec(),
                    }),
                });
            }
        }
        Ok(())
    }

    fn on_watch_event(&mut self, event: WatcherEvent) {
        if event.event_type == EventType::Session {
            if event.state == KeeperState::Expired {
                warn!("server reports session expired");
                self.teardown(CloseOrigin::Expiry);
            } else {
                self.notify_state(event.state);
            }
            return;
        }
        let targets = self.watches.take_for(event.event_type, &event.path);
        let default = self.shared.default_watcher();
        let watchers = resolve(targets, default.as_ref());
        trace!(
            path = %event.path,
            kind = ?event.event_type,
            watchers = watchers.len(),
            "watch event"
        );
        if !watchers.is_empty() {
            self.emit(Completion::Watch {
                event: WatchedEvent::from(event),
                watchers,
            });
        }
    }

    fn notify_state(&self, state: KeeperState) {
        let mut targets = vec![WatchTarget::Default];
        targets.extend(self.watches.all_targets());
        let default = self.shared.default_watcher();
        let watchers = resolve(targets, default.as_ref());
        if !watchers.is_empty() {
            self.emit(Completion::StateChange {
                event: WatchedEvent::session(state),
                watchers,
            });
        }
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn emit(&self, item: Completion) {
        if let Err(item) = self.shared.completions.push(item) {
            warn!(item = ?item, "completion queue finished; dropping item");
        }
    }

    fn complete_request(&self, request: OutboundRequest, result: Result<Reply, SessionError>) {
        if request.internal {
            return;
        }
        self.emit(Completion::Reply {
            xid: request.xid,
            sink: request.sink,
            result,
        });
    }

    fn flush(&mut self, now: Instant) {
        let requests_allowed = self.state == State::Connected;
        if !self.mux.has_output(requests_allowed) {
            return;
        }
        let outcome = self.mux.flush(&mut self.transport, requests_allowed);
        if outcome.bytes > 0 {
            trace!(bytes = outcome.bytes, frames = outcome.frames, "flushed");
            self.last_send = now;
        }
        if let Some(e) = self.settle(outcome) {
            self.lose_connection(Loss::Io(e), now);
        }
    }

    /// Fails requests a flush could not encode; returns the transport error.
    fn settle(&self, outcome: FlushOutcome) -> Option<io::Error> {
        for (request, e) in outcome.rejected {
            warn!(xid = %request.xid, error = %e, "request cannot be encoded");
            self.complete_request(request, Err(SessionError::Protocol(e)));
        }
        outcome.error
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn lose_connection(&mut self, reason: Loss, now: Instant) {
        let from = self.state;
        warn!(
            state = %from,
            epoch = self.epoch,
            endpoint = ?self.endpoint,
            reason = ?reason,
            "connection lost"
        );
        self.transport.shutdown();
        self.inbound.clear();
        self.ping_outstanding = false;

        let in_flight = self.mux.take_in_flight();
        if !in_flight.is_empty() {
            debug!(count = in_flight.len(), "failing in-flight requests");
        }
        for request in in_flight {
            self.complete_request(request, Err(SessionError::ConnectionLoss));
        }
        self.mux.end_epoch();

        if from == State::Connected {
            self.notify_state(KeeperState::Disconnected);
        } else {
            self.note_failure(now);
        }
        self.endpoint = None;
        self.set_state(State::Disconnected);
        self.try_connect(now);
    }

    /// Flushes a close-session request, bounded by `close_drain_timeout`.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn send_close_request(&mut self) -> bool {
        let xid = self.shared.submit.allocate_xid();
        self.mux
            .push_back(OutboundRequest::internal(xid, OpCode::CloseSession, Vec::new()));
        let deadline = Instant::now() + self.config.close_drain_timeout;
        loop {
            let outcome = self.mux.flush(&mut self.transport, true);
            if let Some(e) = self.settle(outcome) {
                debug!(error = %e, "close request not flushed");
                return false;
            }
            if !self.mux.has_output(true) {
                return true;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            match self.transport.wait_writable(left) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("close request flush timed out");
                    return false;
                }
                Err(e) => {
                    debug!(error = %e, "close request not flushed");
                    return false;
                }
            }
        }
    }

    /// Runs the ordered teardown if this call wins the lifecycle claim.
    pub(crate) fn teardown(&mut self, origin: CloseOrigin) -> Option<TeardownReport> {
        if !self.shared.lifecycle.begin_teardown() {
            debug!(origin = ?origin, "teardown already claimed");
            return None;
        }
        info!(origin = ?origin, state = %self.state, "closing session");
        let mut report = TeardownReport::new(origin);
        let was_connected = self.state == State::Connected;

        let mut leftovers = self.shared.submit.close();
        self.mux.absorb(&mut leftovers);
        self.mux.pull(&self.shared.submit);

        if origin == CloseOrigin::Caller && was_connected {
            report.close_request_sent = self.send_close_request();
        }

        report.transport_released = self.transport.shutdown();
        self.inbound.clear();
        self.set_state(match origin {
            CloseOrigin::Caller => State::Closed,
            CloseOrigin::Expiry => State::Expired,
        });

        for request in self.mux.drain_all() {
            if request.internal {
                continue;
            }
            report.failed_requests += 1;
            let error = match origin {
                CloseOrigin::Caller => SessionError::Closing,
                CloseOrigin::Expiry => SessionError::SessionExpired,
            };
            self.complete_request(request, Err(error));
        }
        if origin == CloseOrigin::Expiry {
            self.notify_state(KeeperState::Expired);
        }
        self.shared.completions.finish();

        report.hosts_released = self.hosts.release();
        let watches = std::mem::take(&mut self.watches);
        report.watches_released = watches.len();
        let default = self.shared.set_default_watcher(None);
        self.endpoint = None;
        self.retry_at = None;

        self.shared.lifecycle.finish_teardown();
        info!(report = ?report, "session closed");
        self.report = Some(report.clone());

        // Watchers are user objects and may own the session itself, so they
        // are dropped only after the lifecycle reads closed.
        drop(watches);
        drop(default);
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::HostOrder;
    use crate::net::transport::scripted::{FAKE_FD, ScriptHandle, ScriptedTransport};
    use crate::proto::{ErrorCode, RequestHeader, SetWatches, encode_reply};
    use crate::session::Phase;
    use crate::session::request::Request;
    use crate::session::watch::Watcher;

    const SESSION_ID: i64 = 0x1234;
    const PASSWORD: [u8; PASSWORD_LEN] = [7; PASSWORD_LEN];

    #[derive(Default)]
    struct Recorder(Mutex<Vec<WatchedEvent>>);

    impl Watcher for Recorder {
        fn process(&self, event: &WatchedEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn states(&self) -> Vec<KeeperState> {
            self.0.lock().unwrap().iter().map(|e| e.state).collect()
        }
    }

    struct Harness {
        engine: Engine<ScriptedTransport>,
        script: ScriptHandle,
        shared: Arc<Shared>,
        recorder: Arc<Recorder>,
        now: Instant,
    }

    fn harness_with(hosts: usize, config: SessionConfig) -> Harness {
        let endpoints = (0..hosts)
            .map(|i| Endpoint::localhost(2181 + u16::try_from(i).unwrap()))
            .collect();
        let hosts = HostList::from_endpoints(endpoints, HostOrder::Deterministic).unwrap();
        let (transport, script) = ScriptedTransport::new();
        let shared = Shared::new();
        let recorder = Arc::new(Recorder::default());
        shared.set_default_watcher(Some(recorder.clone() as Arc<dyn Watcher>));
        Harness {
            engine: Engine::new(config, hosts, None, transport, Arc::clone(&shared)),
            script,
            shared,
            recorder,
            now: Instant::now(),
        }
    }

    fn harness() -> Harness {
        harness_with(1, SessionConfig::default())
    }

    fn granted(timeout_ms: i32, session_id: i64) -> Vec<u8> {
        ConnectResponse {
            protocol_version: 0,
            timeout_ms,
            session_id,
            password: PASSWORD.to_vec(),
        }
        .encode()
        .unwrap()
    }

    fn reply_frame(xid: Xid, zxid: i64, err: ErrorCode, payload: &[u8]) -> Vec<u8> {
        encode_reply(ReplyHeader { xid, zxid, err }, payload).unwrap()
    }

    impl Harness {
        fn interest(&mut self) -> Interest {
            self.engine.interest(self.now).unwrap()
        }

        fn process(&mut self, readiness: Readiness) -> Option<Transition> {
            self.engine.process(readiness, self.now).unwrap()
        }

        fn advance(&mut self, d: Duration) {
            self.now = self.now + d;
        }

        fn inbound(&self, frame: &[u8]) {
            self.script.lock().push_inbound(frame);
        }

        fn connect(&mut self) {
            self.connect_with(SESSION_ID);
        }

        fn connect_with(&mut self, session_id: i64) {
            self.interest();
            assert_eq!(self.engine.state(), State::Connecting);
            self.process(Readiness::BOTH);
            assert_eq!(self.engine.state(), State::Associating);
            self.inbound(&granted(30_000, session_id));
            self.process(Readiness::READABLE);
            assert_eq!(self.engine.state(), State::Connected);
            // Later `written()` calls see only what follows the handshake.
            let handshake = self.script.lock().take_frames();
            assert_eq!(handshake.len(), 1);
        }

        fn submit(&self, request: Request) -> Xid {
            self.shared.submit(request, None).unwrap()
        }

        fn written(&self) -> Vec<(Xid, i32, Vec<u8>)> {
            self.script
                .lock()
                .take_frames()
                .iter()
                .filter_map(|body| {
                    let (header, payload) = RequestHeader::decode(body).ok()?;
                    Some((header.xid, header.opcode, payload.to_vec()))
                })
                .collect()
        }

        fn completions(&self) -> Vec<Completion> {
            std::iter::from_fn(|| self.shared.completions.pop()).collect()
        }

        fn reply_results(&self) -> Vec<(Xid, Result<ErrorCode, String>)> {
            self.completions()
                .into_iter()
                .filter_map(|c| match c {
                    Completion::Reply { xid, result, .. } => {
                        Some((xid, result.map(|r| r.err).map_err(|e| e.to_string())))
                    }
                    _ => None,
                })
                .collect()
        }
    }

    fn sync_request() -> Request {
        Request::new(OpCode::Sync, b"/".to_vec())
    }

    #[test]
    fn handshake_sequence_and_interest() {
        let mut h = harness();
        assert_eq!(h.engine.state(), State::Disconnected);

        let interest = h.interest();
        assert_eq!(h.engine.state(), State::Connecting);
        assert_eq!(interest.descriptor, Some(FAKE_FD));
        assert!(interest.readable && interest.writable);

        let transition = h.process(Readiness::BOTH);
        assert_eq!(
            transition,
            Some(Transition {
                from: State::Connecting,
                to: State::Associating
            })
        );
        let frames = h.script.lock().take_frames();
        assert_eq!(frames.len(), 1);
        let handshake = ConnectRequest::decode(&frames[0]).unwrap();
        assert_eq!(handshake.protocol_version, PROTOCOL_VERSION);
        assert_eq!(handshake.session_id, 0);
        assert_eq!(handshake.timeout_ms, 30_000);
        assert_eq!(handshake.password, vec![0; PASSWORD_LEN]);

        let interest = h.interest();
        assert!(interest.readable);
        assert!(!interest.writable);

        h.inbound(&granted(12_000, SESSION_ID));
        h.process(Readiness::READABLE);
        assert_eq!(h.engine.state(), State::Connected);
        assert_eq!(h.shared.state(), State::Connected);
        assert_eq!(h.engine.credentials().session_id, SESSION_ID);
        assert_eq!(h.engine.credentials().password, PASSWORD.to_vec());
        assert_eq!(h.engine.negotiated_timeout(), Duration::from_secs(12));
        assert_eq!(h.shared.session_id(), SESSION_ID);

        for item in h.completions() {
            item.deliver();
        }
        assert_eq!(h.recorder.states(), vec![KeeperState::SyncConnected]);
    }

    #[test]
    fn requests_wait_for_the_handshake() {
        let mut h = harness();
        h.interest();
        let xid = h.submit(sync_request());
        h.process(Readiness::BOTH);
        // Only the handshake went out.
        assert_eq!(h.script.lock().take_frames().len(), 1);

        h.inbound(&granted(30_000, SESSION_ID));
        h.process(Readiness::READABLE);
        let written = h.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, xid);
    }

    #[test]
    fn replies_complete_in_submission_order() {
        let mut h = harness();
        h.connect();
        h.completions();

        let xids: Vec<Xid> = (0..3).map(|_| h.submit(sync_request())).collect();
        h.process(Readiness::WRITABLE);
        let sent: Vec<Xid> = h.written().into_iter().map(|(xid, ..)| xid).collect();
        assert_eq!(sent, xids);

        for (i, xid) in xids.iter().enumerate() {
            h.inbound(&reply_frame(*xid, 100 + i64::try_from(i).unwrap(), ErrorCode::Ok, b""));
        }
        h.process(Readiness::READABLE);
        let results = h.reply_results();
        assert_eq!(
            results,
            xids.iter().map(|x| (*x, Ok(ErrorCode::Ok))).collect::<Vec<_>>()
        );
        assert_eq!(h.engine.last_zxid(), 102);
    }

    #[test]
    fn server_error_codes_are_replies_not_failures() {
        let mut h = harness();
        h.connect();
        h.completions();
        let xid = h.submit(sync_request());
        h.process(Readiness::WRITABLE);
        h.inbound(&reply_frame(xid, 5, ErrorCode::NoNode, b""));
        h.process(Readiness::READABLE);
        assert_eq!(h.reply_results(), vec![(xid, Ok(ErrorCode::NoNode))]);
    }

    #[test]
    fn out_of_order_reply_drops_the_connection() {
        let mut h = harness_with(2, SessionConfig::default());
        h.connect();
        h.completions();
        let first = h.submit(sync_request());
        let second = h.submit(sync_request());
        h.process(Readiness::WRITABLE);

        h.inbound(&reply_frame(second, 1, ErrorCode::Ok, b""));
        h.process(Readiness::READABLE);

        let loss = SessionError::ConnectionLoss.to_string();
        assert_eq!(
            h.reply_results(),
            vec![(first, Err(loss.clone())), (second, Err(loss))]
        );
        assert_eq!(h.engine.state(), State::Connecting);
        let connects = h.script.lock().connects.clone();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[1].addr().port(), 2182);
    }

    #[test]
    fn reconnect_fails_in_flight_and_carries_unsent() {
        let mut h = harness();
        h.connect();
        h.completions();

        let in_flight = h.submit(sync_request());
        h.process(Readiness::WRITABLE);
        assert_eq!(h.written().len(), 1);

        h.script.lock().send_blocked = true;
        let unsent = h.submit(sync_request());
        h.process(Readiness::WRITABLE);

        h.script.lock().peer_closed = true;
        h.process(Readiness::READABLE);
        assert_eq!(h.engine.state(), State::Connecting);

        let completions = h.completions();
        let replies: Vec<_> = completions.iter().filter_map(Completion::xid).collect();
        assert_eq!(replies, vec![in_flight]);
        assert!(completions.iter().any(|c| matches!(
            c,
            Completion::StateChange { event, .. } if event.state == KeeperState::Disconnected
        )));

        h.script.lock().send_blocked = false;
        h.process(Readiness::BOTH);
        assert_eq!(h.engine.state(), State::Associating);
        let frames = h.script.lock().take_frames();
        let handshake = ConnectRequest::decode(&frames[0]).unwrap();
        assert_eq!(handshake.session_id, SESSION_ID);
        assert_eq!(handshake.password, PASSWORD.to_vec());

        h.inbound(&granted(30_000, SESSION_ID));
        h.process(Readiness::READABLE);
        let resent: Vec<Xid> = h.written().into_iter().map(|(xid, ..)| xid).collect();
        assert_eq!(resent, vec![unsent]);
    }

    #[test]
    fn idle_session_pings_then_dies_silently() {
        let mut h = harness();
        h.connect();

        let interest = h.interest();
        assert!(!interest.writable);
        assert_eq!(interest.deadline, h.now + Duration::from_secs(10));

        h.advance(Duration::from_secs(10));
        let interest = h.interest();
        assert!(interest.writable);
        h.process(Readiness::WRITABLE);
        let written = h.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, Xid::PING);
        assert_eq!(written[0].1, OpCode::Ping.as_i32());

        // No second ping while one is outstanding.
        h.advance(Duration::from_secs(10));
        assert!(!h.interest().writable);

        h.advance(Duration::from_secs(10));
        h.interest();
        assert_eq!(h.engine.state(), State::Connecting);
    }

    #[test]
    fn ping_reply_refreshes_liveness() {
        let mut h = harness();
        h.connect();
        h.advance(Duration::from_secs(10));
        h.interest();
        h.process(Readiness::WRITABLE);
        h.written();

        h.advance(Duration::from_secs(5));
        h.inbound(&reply_frame(Xid::PING, 0, ErrorCode::Ok, b""));
        h.process(Readiness::READABLE);

        h.advance(Duration::from_secs(20));
        h.interest();
        assert_eq!(h.engine.state(), State::Connected);
    }

    #[test]
    fn denied_handshake_expires_and_fails_everything() {
        let mut h = harness();
        h.interest();
        h.process(Readiness::BOTH);
        let xid = h.submit(sync_request());

        h.inbound(&granted(0, 0));
        h.script.lock().peer_closed = true;
        let err = h.engine.process(Readiness::READABLE, h.now).unwrap();
        assert_eq!(
            err,
            Some(Transition {
                from: State::Associating,
                to: State::Expired
            })
        );
        assert_eq!(h.shared.state(), State::Expired);
        assert!(h.shared.completions.is_finished());

        let completions = h.completions();
        assert!(matches!(
            &completions[0],
            Completion::Reply { xid: x, result: Err(SessionError::SessionExpired), .. } if *x == xid
        ));
        for item in completions {
            item.deliver();
        }
        assert_eq!(h.recorder.states(), vec![KeeperState::Expired]);

        assert!(matches!(
            h.engine.interest(h.now),
            Err(SessionError::InvalidState(State::Expired))
        ));
        assert!(h.engine.teardown(CloseOrigin::Caller).is_none());
        assert!(matches!(
            h.shared.submit(sync_request(), None),
            Err(SessionError::InvalidState(State::Expired))
        ));
        let report = h.engine.take_report().unwrap();
        assert_eq!(report.origin, CloseOrigin::Expiry);
        assert_eq!(report.failed_requests, 1);
    }

    #[test]
    fn resumed_session_with_new_id_is_expired() {
        let mut h = harness();
        h.connect();
        h.script.lock().peer_closed = true;
        h.process(Readiness::READABLE);
        h.process(Readiness::BOTH);
        h.inbound(&granted(30_000, SESSION_ID + 1));
        h.process(Readiness::READABLE);
        assert_eq!(h.engine.state(), State::Expired);
    }

    #[test]
    fn expired_session_event_tears_down() {
        let mut h = harness();
        h.connect();
        let push = WatcherEvent {
            event_type: EventType::Session,
            state: KeeperState::Expired,
            path: String::new(),
        }
        .encode_push(-1)
        .unwrap();
        h.inbound(&push);
        h.process(Readiness::READABLE);
        assert_eq!(h.engine.state(), State::Expired);
        assert_eq!(h.engine.take_report().unwrap().origin, CloseOrigin::Expiry);
    }

    #[test]
    fn watch_armed_by_success_fires_once() {
        let mut h = harness();
        h.connect();
        h.completions();

        let armed = h.submit(Request::get_data("/a", Some(WatchTarget::Default)).unwrap());
        let refused = h.submit(Request::get_data("/b", Some(WatchTarget::Default)).unwrap());
        h.process(Readiness::WRITABLE);
        h.inbound(&reply_frame(armed, 1, ErrorCode::Ok, b""));
        h.inbound(&reply_frame(refused, 2, ErrorCode::NoNode, b""));
        h.process(Readiness::READABLE);
        h.completions();

        for path in ["/a", "/b", "/a"] {
            let push = WatcherEvent {
                event_type: EventType::NodeDataChanged,
                state: KeeperState::SyncConnected,
                path: path.into(),
            }
            .encode_push(-1)
            .unwrap();
            h.inbound(&push);
        }
        h.process(Readiness::READABLE);

        let fired: Vec<_> = h
            .completions()
            .into_iter()
            .filter_map(|c| match c {
                Completion::Watch { event, watchers } => Some((event.path, watchers.len())),
                _ => None,
            })
            .collect();
        assert_eq!(fired, vec![(Some("/a".to_string()), 1)]);
    }

    #[test]
    fn watches_are_rearmed_after_reconnect() {
        let mut h = harness();
        h.connect();
        let xid = h.submit(Request::exists("/gone", Some(WatchTarget::Default)).unwrap());
        h.process(Readiness::WRITABLE);
        h.inbound(&reply_frame(xid, 77, ErrorCode::NoNode, b""));
        h.process(Readiness::READABLE);
        h.written();

        h.script.lock().peer_closed = true;
        h.process(Readiness::READABLE);
        let pending = h.submit(sync_request());
        h.process(Readiness::BOTH);
        h.script.lock().take_frames();
        h.inbound(&granted(30_000, SESSION_ID));
        h.process(Readiness::READABLE);

        let written = h.written();
        assert_eq!(written[0].0, Xid::SET_WATCHES);
        assert_eq!(written[0].1, OpCode::SetWatches.as_i32());
        let set = SetWatches::decode(&written[0].2).unwrap();
        assert_eq!(set.relative_zxid, 77);
        assert_eq!(set.exist, vec!["/gone".to_string()]);
        assert!(set.data.is_empty() && set.child.is_empty());
        assert_eq!(written[1].0, pending);
    }

    #[test]
    fn caller_close_when_connected_sends_close_request() {
        let mut h = harness();
        h.connect();
        let xid = h.submit(sync_request());
        h.process(Readiness::WRITABLE);
        h.written();
        h.completions();

        let report = h.engine.teardown(CloseOrigin::Caller).unwrap();
        assert!(report.close_request_sent);
        assert!(report.transport_released);
        assert_eq!(report.hosts_released, 1);
        assert_eq!(report.failed_requests, 1);
        assert_eq!(h.engine.state(), State::Closed);

        let written = h.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].1, OpCode::CloseSession.as_i32());
        assert_eq!(
            h.reply_results(),
            vec![(xid, Err(SessionError::Closing.to_string()))]
        );
        assert!(h.shared.completions.is_finished());
        assert!(h.shared.default_watcher().is_none());
    }

    #[test]
    fn close_never_connected_releases_hosts_only() {
        let mut h = harness_with(3, SessionConfig::default());
        let report = h.engine.teardown(CloseOrigin::Caller).unwrap();
        assert!(!report.close_request_sent);
        assert!(!report.transport_released);
        assert_eq!(report.hosts_released, 3);
        assert_eq!(report.failed_requests, 0);
        assert_eq!(h.script.lock().shutdowns, 0);
    }

    #[test]
    fn close_while_connecting_skips_close_request() {
        let mut h = harness();
        h.interest();
        let report = h.engine.teardown(CloseOrigin::Caller).unwrap();
        assert!(!report.close_request_sent);
        assert!(report.transport_released);
        assert!(h.written().is_empty());
    }

    #[test]
    fn close_request_on_a_full_socket_gives_up() {
        let mut h = harness();
        h.connect();
        h.script.lock().send_blocked = true;
        let report = h.engine.teardown(CloseOrigin::Caller).unwrap();
        assert!(!report.close_request_sent);
        assert!(report.transport_released);
        assert_eq!(h.script.lock().writable_waits, 1);
        assert_eq!(h.engine.state(), State::Closed);
    }

    /// Records the lifecycle phase at the moment it is dropped.
    struct PhaseOnDrop {
        shared: std::sync::Weak<Shared>,
        seen: Arc<Mutex<Option<Phase>>>,
    }

    impl Watcher for PhaseOnDrop {
        fn process(&self, _: &WatchedEvent) {}
    }

    impl Drop for PhaseOnDrop {
        fn drop(&mut self) {
            if let Some(shared) = self.shared.upgrade() {
                *self.seen.lock().unwrap() = Some(shared.lifecycle.phase());
            }
        }
    }

    #[test]
    fn watchers_are_released_after_the_lifecycle_closes() {
        let mut h = harness();
        h.connect();
        let seen = Arc::new(Mutex::new(None));
        let default = Arc::new(PhaseOnDrop {
            shared: Arc::downgrade(&h.shared),
            seen: Arc::clone(&seen),
        });
        h.shared.set_default_watcher(Some(default as Arc<dyn Watcher>));
        let armed = Arc::new(PhaseOnDrop {
            shared: Arc::downgrade(&h.shared),
            seen: Arc::new(Mutex::new(None)),
        });
        let armed_seen = Arc::clone(&armed.seen);
        let xid = h.submit(
            Request::exists("/owner", Some(WatchTarget::Default))
                .unwrap()
                .watched_by(armed),
        );
        h.process(Readiness::WRITABLE);
        h.inbound(&reply_frame(xid, 3, ErrorCode::Ok, b""));
        h.process(Readiness::READABLE);
        h.completions();

        let report = h.engine.teardown(CloseOrigin::Caller).unwrap();
        assert_eq!(report.watches_released, 1);
        assert_eq!(*seen.lock().unwrap(), Some(Phase::Closed));
        assert_eq!(*armed_seen.lock().unwrap(), Some(Phase::Closed));
    }

    #[test]
    fn requested_close_runs_on_next_turn() {
        let mut h = harness();
        h.connect();
        assert!(h.shared.request_close());
        assert!(matches!(
            h.engine.interest(h.now),
            Err(SessionError::InvalidState(State::Closed))
        ));
        assert!(h.engine.take_report().unwrap().close_request_sent);
    }

    #[test]
    fn failed_hosts_rotate_then_back_off() {
        let config = SessionConfig {
            reconnect_backoff: Duration::from_millis(500),
            ..SessionConfig::default()
        };
        let mut h = harness_with(2, config);
        h.script
            .lock()
            .connect_failures
            .extend([ErrorKind::ConnectionRefused, ErrorKind::ConnectionRefused]);

        let interest = h.interest();
        assert_eq!(h.engine.state(), State::Disconnected);
        assert_eq!(interest.descriptor, None);
        assert_eq!(interest.deadline, h.now);

        let interest = h.interest();
        assert_eq!(h.script.lock().connects.len(), 2);
        assert_eq!(interest.deadline, h.now + Duration::from_millis(500));

        h.interest();
        assert_eq!(h.script.lock().connects.len(), 2);

        h.advance(Duration::from_millis(500));
        h.interest();
        assert_eq!(h.engine.state(), State::Connecting);
        let ports: Vec<u16> = h.script.lock().connects.iter().map(|e| e.addr().port()).collect();
        assert_eq!(ports, vec![2181, 2182, 2181]);
    }

    #[test]
    fn connect_timeout_moves_to_next_host() {
        let mut h = harness_with(2, SessionConfig::default());
        h.script.lock().connect_pending = true;
        h.interest();
        h.process(Readiness::BOTH);
        assert_eq!(h.engine.state(), State::Connecting);

        // 30 s session timeout over two hosts.
        h.advance(Duration::from_secs(15));
        h.interest();
        assert_eq!(h.engine.state(), State::Connecting);
        assert_eq!(h.engine.endpoint().unwrap().addr().port(), 2182);
        assert!(h.engine.epoch() >= 2);
    }

    #[test]
    fn oversized_frame_is_a_protocol_loss() {
        let config = SessionConfig {
            max_frame_len: 64,
            ..SessionConfig::default()
        };
        let mut h = harness_with(1, config);
        h.connect();
        h.inbound(&1024i32.to_be_bytes());
        h.process(Readiness::READABLE);
        assert_eq!(h.engine.state(), State::Connecting);
    }
}
