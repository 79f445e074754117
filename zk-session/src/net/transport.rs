//! Byte-stream transport to one server.
//!
//! The engine owns exactly one [`Transport`] and drives it with
//! non-blocking calls; readiness comes from the embedder's poller.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use mio::net::TcpStream;
use rustix::event::{Nsecs, PollFd, PollFlags, Secs, Timespec};

use super::Endpoint;

/// Non-blocking stream connection, reopened for every connection epoch.
pub trait Transport: Send {
    /// Starts a connect to `endpoint`, dropping any previous socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt fails immediately.
    fn connect(&mut self, endpoint: &Endpoint) -> io::Result<()>;

    /// Checks a pending connect. `Ok(true)` once established, `Ok(false)`
    /// while still in progress.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the attempt failed.
    fn finish_connect(&mut self) -> io::Result<bool>;

    /// Writes as much of `buf` as the socket accepts.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when the socket is full; any other error is fatal for
    /// the connection.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Reads into `buf`; `Ok(0)` means the peer closed.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when nothing is buffered; any other error is fatal for
    /// the connection.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Blocks until the socket can take more bytes or `timeout` passes.
    /// `Ok(false)` means the timeout passed.
    ///
    /// Only used to drain the close request, after the embedder's poller
    /// has stopped driving the connection.
    ///
    /// # Errors
    ///
    /// Returns the poll error; `NotConnected` without a socket.
    fn wait_writable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Descriptor the embedder should poll, if a socket is open.
    fn descriptor(&self) -> Option<RawFd>;

    /// Closes the socket. Returns whether one was open.
    fn shutdown(&mut self) -> bool;
}

/// TCP transport on a mio stream.
#[derive(Debug, Default)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    nodelay: bool,
}

impl TcpTransport {
    #[must_use]
    pub const fn new(nodelay: bool) -> Self {
        Self {
            stream: None,
            nodelay,
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, endpoint: &Endpoint) -> io::Result<()> {
        self.shutdown();
        let stream = TcpStream::connect(endpoint.addr())?;
        // mio doesn't expose these; go through rustix like the other options.
        rustix::net::sockopt::set_tcp_nodelay(stream.as_fd(), self.nodelay)?;
        rustix::net::sockopt::set_socket_keepalive(stream.as_fd(), true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn finish_connect(&mut self) -> io::Result<bool> {
        let stream = self.stream()?;
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }

    fn wait_writable(&mut self, timeout: Duration) -> io::Result<bool> {
        let stream = self.stream()?;
        let timeout = Timespec {
            tv_sec: Secs::try_from(timeout.as_secs()).unwrap_or(Secs::MAX),
            tv_nsec: Nsecs::from(timeout.subsec_nanos()),
        };
        let mut fds = [PollFd::new(stream, PollFlags::OUT)];
        loop {
            match rustix::event::poll(&mut fds, Some(&timeout)) {
                Ok(ready) => return Ok(ready > 0),
                Err(rustix::io::Errno::INTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn descriptor(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn shutdown(&mut self) -> bool {
        match self.stream.take() {
            Some(stream) => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
                true
            }
            None => false,
        }
    }
}

/// In-memory transport driven by a shared script, for engine unit tests.
#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::VecDeque;
    use std::io::{self, ErrorKind};
    use std::os::fd::RawFd;
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::Duration;

    use super::Transport;
    use crate::net::Endpoint;
    use crate::proto::{DEFAULT_MAX_FRAME_LEN, FrameAssembler};

    /// Descriptor reported while a scripted socket is open.
    pub(crate) const FAKE_FD: RawFd = 100;

    #[derive(Debug, Default)]
    pub(crate) struct Script {
        pub connects: Vec<Endpoint>,
        /// Errors handed out by the next `connect` calls, in order.
        pub connect_failures: VecDeque<ErrorKind>,
        /// Keep `finish_connect` reporting "in progress".
        pub connect_pending: bool,
        pub written: Vec<u8>,
        pub inbound: VecDeque<u8>,
        /// Cap on bytes accepted per `send`, to force partial writes.
        pub send_limit: Option<usize>,
        /// Accept no bytes at all (full socket buffer).
        pub send_blocked: bool,
        /// Total bytes accepted before the socket reports full.
        pub send_budget: Option<usize>,
        pub send_error: Option<ErrorKind>,
        /// Calls to `wait_writable`. A blocked or spent socket never becomes
        /// writable.
        pub writable_waits: usize,
        pub peer_closed: bool,
        pub open: bool,
        pub shutdowns: usize,
    }

    impl Script {
        /// Takes every complete frame body written so far.
        pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
            let mut asm = FrameAssembler::new(DEFAULT_MAX_FRAME_LEN);
            asm.extend(&std::mem::take(&mut self.written));
            let mut frames = Vec::new();
            while let Ok(Some(body)) = asm.next_frame() {
                frames.push(body);
            }
            frames
        }

        pub fn push_inbound(&mut self, frame: &[u8]) {
            self.inbound.extend(frame.iter().copied());
        }
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct ScriptHandle(Arc<Mutex<Script>>);

    impl ScriptHandle {
        pub fn lock(&self) -> MutexGuard<'_, Script> {
            self.0.lock().unwrap()
        }
    }

    #[derive(Debug)]
    pub(crate) struct ScriptedTransport {
        script: ScriptHandle,
    }

    impl ScriptedTransport {
        pub fn new() -> (Self, ScriptHandle) {
            let script = ScriptHandle::default();
            (
                Self {
                    script: script.clone(),
                },
                script,
            )
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self, endpoint: &Endpoint) -> io::Result<()> {
            let mut s = self.script.lock();
            s.connects.push(endpoint.clone());
            if let Some(kind) = s.connect_failures.pop_front() {
                s.open = false;
                return Err(kind.into());
            }
            s.open = true;
            s.peer_closed = false;
            s.inbound.clear();
            Ok(())
        }

        fn finish_connect(&mut self) -> io::Result<bool> {
            let s = self.script.lock();
            if !s.open {
                return Err(ErrorKind::NotConnected.into());
            }
            Ok(!s.connect_pending)
        }

        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut s = self.script.lock();
            if let Some(kind) = s.send_error {
                return Err(kind.into());
            }
            if s.send_blocked {
                return Err(ErrorKind::WouldBlock.into());
            }
            let mut n = s.send_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
            if let Some(budget) = s.send_budget.as_mut() {
                if *budget == 0 {
                    return Err(ErrorKind::WouldBlock.into());
                }
                n = n.min(*budget);
                *budget -= n;
            }
            s.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn wait_writable(&mut self, _timeout: Duration) -> io::Result<bool> {
            let mut s = self.script.lock();
            if !s.open {
                return Err(ErrorKind::NotConnected.into());
            }
            s.writable_waits += 1;
            Ok(!s.send_blocked && s.send_budget != Some(0))
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut s = self.script.lock();
            if s.inbound.is_empty() {
                return if s.peer_closed {
                    Ok(0)
                } else {
                    Err(ErrorKind::WouldBlock.into())
                };
            }
            let n = buf.len().min(s.inbound.len());
            for (slot, byte) in buf.iter_mut().zip(s.inbound.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn descriptor(&self) -> Option<RawFd> {
            self.script.lock().open.then_some(FAKE_FD)
        }

        fn shutdown(&mut self) -> bool {
            let mut s = self.script.lock();
            let was_open = std::mem::replace(&mut s.open, false);
            if was_open {
                s.shutdowns += 1;
            }
            was_open
        }
    }
}
