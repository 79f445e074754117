//! Session probe.
//!
//! Connects to an ensemble, checks one path, and closes again. Handy for
//! checking that a server is reachable and grants sessions.
//!
//! # Usage
//!
//! ```sh
//! zk-probe --hosts zk1:2181,zk2:2181 --path /services --timeout 10
//! ```

use std::sync::Arc;
use std::time::Duration;

use zk_session::config::{HostOrder, SessionConfig};
use zk_session::error::SessionError;
use zk_session::proto::{KeeperState, Reader};
use zk_session::runtime::ThreadedSession;
use zk_session::session::{CloseStatus, Request, WatchTarget, WatchedEvent, Watcher};
use zk_session::sync::Timeout;

const DEFAULT_HOSTS: &str = "127.0.0.1:2181";
const DEFAULT_PATH: &str = "/";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

struct Args {
    hosts: String,
    path: String,
    timeout: Duration,
    order: HostOrder,
}

fn main() {
    zk_session::init_tracing();
    if let Err(e) = run() {
        eprintln!("zk-probe: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), SessionError> {
    let raw: Vec<String> = std::env::args().collect();
    let args = parse_args(&raw)?;

    let (tx, rx) = crossbeam_channel::unbounded::<WatchedEvent>();
    let watcher: Arc<dyn Watcher> = Arc::new(move |event: &WatchedEvent| {
        let _ = tx.send(event.clone());
    });

    let config = SessionConfig::default()
        .with_session_timeout(args.timeout)
        .with_host_order(args.order);
    let session = ThreadedSession::start(&args.hosts, config, None, Some(watcher))?;
    eprintln!("zk-probe: connecting to {}", args.hosts);

    wait_connected(&rx, args.timeout)?;
    eprintln!("zk-probe: session {:#x} established", session.session_id());

    let request = Request::exists(&args.path, Some(WatchTarget::Default))?;
    let reply = session.call(request, Timeout::Duration(args.timeout))?;
    if reply.is_ok() {
        let mut r = Reader::new(&reply.payload);
        // Stat: czxid, mzxid, ctime, mtime, version, ...
        let czxid = r.take_i64()?;
        let mzxid = r.take_i64()?;
        println!("{}: exists (czxid {czxid:#x}, mzxid {mzxid:#x})", args.path);
    } else {
        println!("{}: {}", args.path, reply.err);
    }

    match session.close() {
        CloseStatus::Closed(report) => eprintln!("zk-probe: closed: {report:?}"),
        CloseStatus::AlreadyClosed => eprintln!("zk-probe: session had already ended"),
    }
    Ok(())
}

fn wait_connected(
    events: &crossbeam_channel::Receiver<WatchedEvent>,
    timeout: Duration,
) -> Result<(), SessionError> {
    loop {
        let event = events
            .recv_timeout(timeout)
            .map_err(|_| SessionError::Timeout)?;
        match event.state {
            KeeperState::SyncConnected => return Ok(()),
            KeeperState::Expired => return Err(SessionError::SessionExpired),
            _ => {}
        }
    }
}

fn invalid(msg: impl Into<String>) -> SessionError {
    SessionError::Resource(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        msg.into(),
    ))
}

fn parse_args(args: &[String]) -> Result<Args, SessionError> {
    let mut hosts = DEFAULT_HOSTS.to_string();
    let mut path = DEFAULT_PATH.to_string();
    let mut timeout_secs = DEFAULT_TIMEOUT_SECS;
    let mut order = HostOrder::Randomized;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--hosts" | "-H" => {
                i += 1;
                hosts = args
                    .get(i)
                    .ok_or_else(|| invalid("missing value for --hosts"))?
                    .clone();
            }
            "--path" | "-p" => {
                i += 1;
                path = args
                    .get(i)
                    .ok_or_else(|| invalid("missing value for --path"))?
                    .clone();
            }
            "--timeout" | "-t" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| invalid("missing value for --timeout"))?;
                timeout_secs = value
                    .parse()
                    .map_err(|e| invalid(format!("bad --timeout {value:?}: {e}")))?;
            }
            "--deterministic" | "-d" => order = HostOrder::Deterministic,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(invalid(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    Ok(Args {
        hosts,
        path,
        timeout: Duration::from_secs(timeout_secs.max(1)),
        order,
    })
}

fn print_usage() {
    eprintln!(
        r"zk-probe - check that an ensemble grants a session

USAGE:
    zk-probe [OPTIONS]

OPTIONS:
    -H, --hosts <LIST>      Comma-separated host:port list [default: {DEFAULT_HOSTS}]
    -p, --path <PATH>       Path to check with exists [default: {DEFAULT_PATH}]
    -t, --timeout <SECS>    Session timeout in seconds [default: {DEFAULT_TIMEOUT_SECS}]
    -d, --deterministic     Try hosts in the order given
    -h, --help              Print help"
    );
}
