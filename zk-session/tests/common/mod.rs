//! A scripted server on localhost TCP for integration tests.
//!
//! Each test drives the server side by hand from its own thread: accept,
//! answer the handshake, read requests, reply, push events, hang up.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use zk_session::net::Endpoint;
use zk_session::proto::{
    ConnectRequest, ConnectResponse, DEFAULT_MAX_FRAME_LEN, ErrorCode, EventType, FrameAssembler,
    KeeperState, PASSWORD_LEN, ReplyHeader, RequestHeader, WatcherEvent, Xid, encode_reply,
};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        zk_session::init_tracing();
    });
}

pub struct FakeServer {
    listener: TcpListener,
}

impl FakeServer {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
        listener.set_nonblocking(true).expect("set nonblocking");
        Self { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().expect("local addr").port()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::localhost(self.port())
    }

    pub fn host_string(&self) -> String {
        format!("127.0.0.1:{}", self.port())
    }

    /// Waits for the next client connection.
    pub fn accept(&self) -> ServerConn {
        self.try_accept(IO_TIMEOUT).expect("client did not connect")
    }

    pub fn try_accept(&self, timeout: Duration) -> Option<ServerConn> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => return Some(ServerConn::new(stream)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }
}

pub struct ServerConn {
    stream: TcpStream,
    frames: FrameAssembler,
}

impl ServerConn {
    fn new(stream: TcpStream) -> Self {
        stream.set_nonblocking(false).expect("set blocking");
        stream.set_read_timeout(Some(IO_TIMEOUT)).expect("read timeout");
        stream.set_nodelay(true).expect("nodelay");
        Self {
            stream,
            frames: FrameAssembler::new(DEFAULT_MAX_FRAME_LEN),
        }
    }

    /// Next frame body, or `None` if the client hung up.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(body) = self.frames.next_frame().expect("well-formed frame") {
                return Some(body);
            }
            match self.stream.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => self.frames.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => panic!("server read failed: {e}"),
            }
        }
    }

    pub fn read_handshake(&mut self) -> ConnectRequest {
        let body = self.next_frame().expect("handshake");
        ConnectRequest::decode(&body).expect("handshake frame")
    }

    /// Reads the next request, skipping pings.
    pub fn read_request(&mut self) -> Option<(RequestHeader, Vec<u8>)> {
        loop {
            let body = self.next_frame()?;
            let (header, payload) = RequestHeader::decode(&body).expect("request header");
            if header.xid == Xid::PING {
                self.reply(Xid::PING, 0, ErrorCode::Ok, b"");
                continue;
            }
            return Some((header, payload.to_vec()));
        }
    }

    pub fn grant(&mut self, session_id: i64, timeout_ms: i32) {
        self.write_frame(
            &ConnectResponse {
                protocol_version: 0,
                timeout_ms,
                session_id,
                password: password_for(session_id),
            }
            .encode()
            .expect("encode response"),
        );
    }

    /// Refuses the session (expired or unknown).
    pub fn deny(&mut self) {
        self.write_frame(
            &ConnectResponse {
                protocol_version: 0,
                timeout_ms: 0,
                session_id: 0,
                password: vec![0; PASSWORD_LEN],
            }
            .encode()
            .expect("encode response"),
        );
    }

    pub fn reply(&mut self, xid: Xid, zxid: i64, err: ErrorCode, payload: &[u8]) {
        let frame = encode_reply(ReplyHeader { xid, zxid, err }, payload).expect("encode reply");
        self.write_frame(&frame);
    }

    pub fn push_event(&mut self, event_type: EventType, state: KeeperState, path: &str) {
        let frame = WatcherEvent {
            event_type,
            state,
            path: path.to_string(),
        }
        .encode_push(-1)
        .expect("encode event");
        self.write_frame(&frame);
    }

    pub fn write_frame(&mut self, frame: &[u8]) {
        self.stream.write_all(frame).expect("server write");
    }

    /// Hangs up without a goodbye.
    pub fn drop_connection(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Password the fake server hands out for a session.
pub fn password_for(session_id: i64) -> Vec<u8> {
    let mut password = vec![0u8; PASSWORD_LEN];
    password[..8].copy_from_slice(&session_id.to_be_bytes());
    password
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
