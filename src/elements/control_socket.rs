//! ControlSocket: the handler namespace over TCP or UNIX stream.
//!
//! A plain element from the engine's view. Its acceptor runs on its
//! own OS thread (blocking I/O is forbidden on driver threads) and
//! each connection gets a thread speaking the line protocol:
//!
//! ```text
//! READ element.handler
//! WRITE element.handler payload
//! ```
//!
//! with responses `200 OK` followed by the payload, or `5xx message`.

use std::any::Any;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::args::Args;
use crate::element::{CleanupStage, Element, ElementError, PortCount, Processing};
use crate::router::{HandlerBuilder, HandlerError, InitContext, Router};

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const BIND_RETRY_DELAY: Duration = Duration::from_millis(100);
const BIND_RETRY_LIMIT: usize = 100;
/// How many successive ports a `PORT+` specification will try.
const PORT_SCAN_RANGE: u16 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Tcp,
    Unix,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Listener {
    fn accept(&self) -> io::Result<Option<Stream>> {
        let result = match self {
            Listener::Tcp(l) => l.accept().map(|(s, _)| Stream::Tcp(s)),
            Listener::Unix(l) => l.accept().map(|(s, _)| Stream::Unix(s)),
        };
        match result {
            Ok(stream) => Ok(Some(stream)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn bind_listener(kind: SocketKind, addr: &str, bound_port: &AtomicU16) -> io::Result<Listener> {
    match kind {
        SocketKind::Tcp => {
            let (base, scan) = match addr.strip_suffix('+') {
                Some(base) => (base, true),
                None => (addr, false),
            };
            let base: u16 = base.trim().parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bad TCP port '{}'", addr),
                )
            })?;
            let range = if scan { PORT_SCAN_RANGE } else { 1 };
            let mut last_err = io::Error::new(io::ErrorKind::AddrInUse, "no port available");
            for offset in 0..range {
                let port = base.saturating_add(offset);
                match TcpListener::bind(("0.0.0.0", port)) {
                    Ok(listener) => {
                        listener.set_nonblocking(true)?;
                        let actual = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                        bound_port.store(actual, Ordering::Release);
                        info!(port = actual, "control socket listening");
                        return Ok(Listener::Tcp(listener));
                    }
                    Err(e) => last_err = e,
                }
            }
            Err(last_err)
        }
        SocketKind::Unix => {
            let path = addr.trim();
            // a stale socket file blocks the bind
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            listener.set_nonblocking(true)?;
            info!(path, "control socket listening");
            Ok(Listener::Unix(listener))
        }
    }
}

type SharedListener = Arc<Mutex<Option<Listener>>>;

/// Exposes the router's handler namespace on a TCP port
/// (`ControlSocket(tcp, 7777)`) or UNIX socket
/// (`ControlSocket(unix, /path)`). A trailing `+` on the port tries
/// successive ports on collision. `RETRIES` allows the bind to be
/// deferred and retried, which hot-swap candidates use while the
/// outgoing router still holds the address; across a swap the new
/// instance adopts its predecessor's bound listener outright.
pub struct ControlSocket {
    kind: SocketKind,
    addr: String,
    retries: usize,
    listener: SharedListener,
    shutdown: Arc<AtomicBool>,
    bound_port: Arc<AtomicU16>,
    router: Mutex<Weak<Router>>,
}

impl Default for ControlSocket {
    fn default() -> Self {
        ControlSocket {
            kind: SocketKind::Tcp,
            addr: String::new(),
            retries: 0,
            listener: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(AtomicBool::new(false)),
            bound_port: Arc::new(AtomicU16::new(0)),
            router: Mutex::new(Weak::new()),
        }
    }
}

impl ControlSocket {
    pub fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::Acquire)
    }
}

impl Element for ControlSocket {
    fn class_name(&self) -> &'static str {
        "ControlSocket"
    }

    fn port_count(&self) -> PortCount {
        PortCount::new(0, 0, 0, 0)
    }

    fn processing(&self) -> Processing {
        Processing::Agnostic
    }

    fn allow_unconnected(&self) -> bool {
        true
    }

    fn configure(&mut self, args: &Args) -> Result<(), ElementError> {
        args.check(2, &["RETRIES"])?;
        let positional = args.positional();
        let kind = positional
            .first()
            .ok_or_else(|| ElementError::configure("expected socket type (tcp or unix)"))?;
        self.kind = match kind.to_ascii_lowercase().as_str() {
            "tcp" => SocketKind::Tcp,
            "unix" => SocketKind::Unix,
            other => {
                return Err(ElementError::configure(format!(
                    "unknown socket type '{}'",
                    other
                )))
            }
        };
        self.addr = positional
            .get(1)
            .ok_or_else(|| ElementError::configure("expected an address"))?
            .clone();
        self.retries = args.get_usize("RETRIES", 0)?;
        Ok(())
    }

    fn initialize(&mut self, ctx: &mut InitContext<'_>) -> Result<(), ElementError> {
        *self.router.lock() = ctx.router_weak();

        // bind now so a bad address fails the load; with RETRIES the
        // acceptor thread keeps trying instead (the hot-swap case,
        // where the outgoing router still holds the address)
        match bind_listener(self.kind, &self.addr, &self.bound_port) {
            Ok(listener) => {
                *self.listener.lock() = Some(listener);
            }
            Err(e) if self.retries > 0 => {
                debug!(error = %e, "bind deferred to acceptor thread");
            }
            Err(e) => {
                return Err(ElementError::initialize(format!(
                    "cannot bind control socket: {}",
                    e
                )))
            }
        }

        let shutdown = Arc::clone(&self.shutdown);
        let listener = Arc::clone(&self.listener);
        let router = ctx.router_weak();
        let binder = BindSpec {
            kind: self.kind,
            addr: self.addr.clone(),
            bound_port: Arc::clone(&self.bound_port),
        };
        thread::Builder::new()
            .name("weft-csock".to_string())
            .spawn(move || acceptor_loop(listener, shutdown, router, binder))
            .map_err(|e| ElementError::initialize(format!("cannot spawn acceptor: {}", e)))?;
        Ok(())
    }

    fn cleanup(&mut self, _stage: CleanupStage) {
        self.shutdown.store(true, Ordering::Release);
        let had_listener = self.listener.lock().take().is_some();
        if had_listener && self.kind == SocketKind::Unix {
            let _ = std::fs::remove_file(self.addr.trim());
        }
    }

    /// Adopt the predecessor's bound listener so the address never
    /// goes dark across a hot-swap.
    fn take_state(&self, predecessor: &dyn Element) {
        if let Some(old) = predecessor.as_any().downcast_ref::<ControlSocket>() {
            old.shutdown.store(true, Ordering::Release);
            let mut mine = self.listener.lock();
            if mine.is_none() {
                if let Some(listener) = old.listener.lock().take() {
                    self.bound_port.store(old.bound_port(), Ordering::Release);
                    *mine = Some(listener);
                    debug!("control socket adopted predecessor listener");
                }
            }
        }
    }

    fn add_handlers(&self, handlers: &mut HandlerBuilder<'_>) {
        handlers.read("port", |c: &ControlSocket| c.bound_port().to_string());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct BindSpec {
    kind: SocketKind,
    addr: String,
    bound_port: Arc<AtomicU16>,
}

fn acceptor_loop(
    listener: SharedListener,
    shutdown: Arc<AtomicBool>,
    router: Weak<Router>,
    binder: BindSpec,
) {
    // hold accepts until the router goes live; a candidate that never
    // activates exits when its router is dropped
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match router.upgrade() {
            Some(r) if r.runcount() > 0 => break,
            Some(_) => thread::sleep(ACCEPT_POLL),
            None => return,
        }
    }

    let mut bind_attempts = 0usize;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        if router.strong_count() == 0 {
            return;
        }

        let accepted = {
            let mut slot = listener.lock();
            if slot.is_none() {
                // deferred or lost bind: keep trying while the old
                // owner lets go of the address
                bind_attempts += 1;
                if bind_attempts > BIND_RETRY_LIMIT {
                    warn!(addr = %binder.addr, "giving up binding control socket");
                    return;
                }
                match bind_listener(binder.kind, &binder.addr, &binder.bound_port) {
                    Ok(l) => *slot = Some(l),
                    Err(_) => {
                        drop(slot);
                        thread::sleep(BIND_RETRY_DELAY);
                        continue;
                    }
                }
            }
            match slot.as_ref().map(|l| l.accept()) {
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    warn!(error = %e, "control socket accept failed");
                    None
                }
                None => None,
            }
        };

        match accepted {
            Some(stream) => {
                let router = router.clone();
                if let Err(e) = thread::Builder::new()
                    .name("weft-csock-conn".to_string())
                    .spawn(move || serve_connection(stream, router))
                {
                    warn!(error = %e, "cannot spawn connection thread");
                }
            }
            None => thread::sleep(ACCEPT_POLL),
        }
    }
}

fn serve_connection(stream: Stream, router: Weak<Router>) {
    match &stream {
        Stream::Tcp(s) => {
            let _ = s.set_nonblocking(false);
        }
        Stream::Unix(s) => {
            let _ = s.set_nonblocking(false);
        }
    }
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let request = line.trim_end_matches(['\r', '\n']);
        if request.is_empty() {
            continue;
        }
        if request.eq_ignore_ascii_case("QUIT") {
            return;
        }
        let response = match router.upgrade() {
            Some(router) => respond(&router, request),
            None => "500 router is gone\n".to_string(),
        };
        if reader.get_mut().write_all(response.as_bytes()).is_err() {
            return;
        }
        let _ = reader.get_mut().flush();
    }
}

fn respond(router: &Router, request: &str) -> String {
    let (verb, rest) = match request.split_once(char::is_whitespace) {
        Some((v, r)) => (v, r.trim()),
        None => (request, ""),
    };
    match verb.to_ascii_uppercase().as_str() {
        "READ" => match router.call_read(rest) {
            Ok(mut value) => {
                let raw = router.handler(rest).map(|h| h.raw()).unwrap_or(false);
                if !raw && !value.ends_with('\n') {
                    value.push('\n');
                }
                format!("200 OK\n{}", value)
            }
            Err(e) => error_response(&e),
        },
        "WRITE" => {
            let (spec, payload) = match rest.split_once(char::is_whitespace) {
                Some((s, p)) => (s, p),
                None => (rest, ""),
            };
            match router.call_write(spec, payload) {
                Ok(()) => "200 OK\n".to_string(),
                Err(e) => error_response(&e),
            }
        }
        "LLRPC" => "501 LLRPC unsupported\n".to_string(),
        _ => format!("501 unknown command '{}'\n", verb),
    }
}

fn error_response(error: &HandlerError) -> String {
    let code = match error {
        HandlerError::NoElement(_) | HandlerError::NoHandler(_) => 511,
        HandlerError::NotReadable(_) | HandlerError::NotWritable(_) => 520,
        HandlerError::Message(_) => 500,
    };
    format!("{} {}\n", code, error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_rejects_bad_type() {
        let mut cs = ControlSocket::default();
        assert!(cs.configure(&Args::parse("udp, 7777").unwrap()).is_err());
        assert!(cs.configure(&Args::parse("tcp").unwrap()).is_err());
        assert!(cs.configure(&Args::parse("tcp, 7777").unwrap()).is_ok());
        assert!(cs
            .configure(&Args::parse("unix, /tmp/weft.sock, RETRIES 1").unwrap())
            .is_ok());
    }

    #[test]
    fn test_port_scan_binds_next_port() {
        let bound = AtomicU16::new(0);
        let first = bind_listener(SocketKind::Tcp, "0", &bound).expect("ephemeral bind");
        let taken = bound.load(Ordering::Acquire);
        // `taken` is now busy; a scan starting there must move past it
        let addr = format!("{}+", taken);
        let second = bind_listener(SocketKind::Tcp, &addr, &bound).expect("scan bind");
        assert!(bound.load(Ordering::Acquire) > taken);
        drop(first);
        drop(second);
    }
}
