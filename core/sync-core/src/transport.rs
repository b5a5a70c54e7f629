//! Transports carry frames between the connection manager and the broker.
//!
//! A transport never blocks on reads: [`Transport::poll`] returns whatever has
//! arrived since the last call. Connection outcomes (`Opened`, `OpenFailed`,
//! `Closed`) are reported through the same queue as inbound frames so the
//! connection manager sees them in delivery order.
//!
//! - [`LineTransport`]: TCP, one JSON frame per line, handshake frame first.
//!   The connect runs on a helper thread and writes are buffered, so neither
//!   `open` nor `send` blocks the caller.
//! - [`MemoryTransport`]: in-memory, scripted through a [`MemoryRemote`].

use crate::error::{Result, SyncError};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;
use tasksync_protocol::{Frame, Handshake, MAX_FRAME_BYTES};
use tracing::debug;
use url::Url;

const READ_CHUNK_SIZE: usize = 4096;
const DEFAULT_PORT: u16 = 8001;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 600;
const MAX_OUTBOUND_BYTES: usize = 4 * MAX_FRAME_BYTES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    OpenFailed(String),
    Frame(Vec<u8>),
    Closed(String),
}

pub trait Transport {
    /// Starts a connection attempt, replacing any connection left over from a
    /// previous attempt. The outcome is reported by `poll`.
    fn open(&mut self, endpoint: &Endpoint, handshake: &Handshake) -> Result<()>;

    /// Returns everything received since the last call, in arrival order.
    fn poll(&mut self) -> Vec<TransportEvent>;

    fn send(&mut self, frame: &Frame) -> Result<()>;

    /// Tears the connection down. Safe to call when nothing is open.
    fn close(&mut self);
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed broker URL.
///
/// Only `tcp://host[:port]` is accepted: the wire format is newline-delimited
/// JSON over a plain socket, with no HTTP upgrade or TLS in front of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |details: String| SyncError::InvalidEndpoint {
            endpoint: raw.to_string(),
            details,
        };

        let url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
        if url.scheme() != "tcp" {
            return Err(invalid(format!(
                "unsupported scheme {} (expected tcp)",
                url.scheme()
            )));
        }
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(invalid("missing host".to_string()));
        }
        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(DEFAULT_PORT)
    }

    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.url
            .socket_addrs(|| Some(self.port()))
            .map_err(|err| SyncError::InvalidEndpoint {
                endpoint: self.url.to_string(),
                details: format!("Failed to resolve: {}", err),
            })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Line-delimited JSON over TCP
// ─────────────────────────────────────────────────────────────────────────────

pub struct LineTransport {
    stream: Option<TcpStream>,
    connecting: Option<Receiver<std::result::Result<TcpStream, String>>>,
    buffer: Vec<u8>,
    outbound: Vec<u8>,
    pending: VecDeque<TransportEvent>,
    connect_timeout: Duration,
}

impl Default for LineTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LineTransport {
    pub fn new() -> Self {
        Self {
            stream: None,
            connecting: None,
            buffer: Vec::new(),
            outbound: Vec::new(),
            pending: VecDeque::new(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bytes accepted by `send` that the socket has not taken yet.
    pub fn pending_write_bytes(&self) -> usize {
        self.outbound.len()
    }

    fn check_connect(&mut self) {
        let Some(receiver) = self.connecting.as_ref() else {
            return;
        };
        let outcome = match receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => Err("connect worker exited".to_string()),
        };
        self.connecting = None;

        match outcome {
            Ok(stream) => {
                self.stream = Some(stream);
                self.pending.push_back(TransportEvent::Opened);
            }
            Err(err) => self.pending.push_back(TransportEvent::OpenFailed(err)),
        }
    }

    /// Writes as much of the outbound buffer as the socket takes without
    /// blocking. Partial frames stay buffered, so framing survives backpressure.
    fn flush_outbound(&mut self) -> std::result::Result<(), String> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while !self.outbound.is_empty() {
            match stream.write(&self.outbound) {
                Ok(0) => return Err("transport close".to_string()),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(format!("transport error: {}", err)),
            }
        }
        Ok(())
    }

    fn drain_lines(&mut self) {
        while let Some(index) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=index).collect();
            let line = &line[..line.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            self.pending.push_back(TransportEvent::Frame(line.to_vec()));
        }
    }

    fn read_available(&mut self) -> Option<String> {
        let stream = self.stream.as_mut()?;
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Some("transport close".to_string()),
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    if self.buffer.len() > MAX_FRAME_BYTES && !self.buffer.contains(&b'\n') {
                        return Some("frame exceeded maximum size".to_string());
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return None,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Some(format!("transport error: {}", err)),
            }
        }
    }

    fn teardown(&mut self) {
        // A connect still in flight delivers into a dropped receiver and its
        // socket is closed on the worker thread.
        self.connecting = None;
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.buffer.clear();
        self.outbound.clear();
    }
}

/// Resolves, connects and sends the handshake. Runs on the connect worker.
fn establish(
    endpoint: &Endpoint,
    handshake: &[u8],
    connect_timeout: Duration,
) -> std::result::Result<TcpStream, String> {
    let addrs = endpoint.socket_addrs().map_err(|err| err.to_string())?;
    let mut last_error = format!("{} resolved to no addresses", endpoint);

    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(mut stream) => {
                let _ = stream.set_nodelay(true);
                let _ =
                    stream.set_write_timeout(Some(Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS)));
                stream
                    .write_all(handshake)
                    .map_err(|err| format!("Failed to send handshake: {}", err))?;
                stream
                    .set_nonblocking(true)
                    .map_err(|err| format!("Failed to set non-blocking: {}", err))?;
                return Ok(stream);
            }
            Err(err) => {
                last_error = format!("Failed to connect to {}: {}", addr, err);
            }
        }
    }

    Err(last_error)
}

impl Transport for LineTransport {
    fn open(&mut self, endpoint: &Endpoint, handshake: &Handshake) -> Result<()> {
        self.teardown();
        debug!(endpoint = %endpoint, "Opening line transport");

        let payload = Frame::handshake(handshake).and_then(|frame| frame.encode())?;
        let endpoint = endpoint.clone();
        let connect_timeout = self.connect_timeout;
        let (tx, rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name("tasksync-connect".to_string())
            .spawn(move || {
                let _ = tx.send(establish(&endpoint, &payload, connect_timeout));
            });
        match spawned {
            Ok(_) => self.connecting = Some(rx),
            Err(err) => self.pending.push_back(TransportEvent::OpenFailed(format!(
                "Failed to start connect worker: {}",
                err
            ))),
        }
        Ok(())
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        self.check_connect();
        let closed = match self.flush_outbound() {
            Ok(()) => self.read_available(),
            Err(reason) => Some(reason),
        };
        self.drain_lines();
        if let Some(reason) = closed {
            self.teardown();
            self.pending.push_back(TransportEvent::Closed(reason));
        }
        self.pending.drain(..).collect()
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        if self.stream.is_none() {
            return Err(SyncError::NotConnected);
        }
        let payload = frame.encode()?;
        if self.outbound.len() + payload.len() > MAX_OUTBOUND_BYTES {
            return Err(SyncError::Transport(format!(
                "Send buffer full ({} bytes pending)",
                self.outbound.len()
            )));
        }
        self.outbound.extend_from_slice(&payload);
        self.flush_outbound()
            .map_err(|err| SyncError::Transport(format!("Failed to write frame: {}", err)))
    }

    fn close(&mut self) {
        self.teardown();
        self.pending.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory transport
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryLink {
    inbound: VecDeque<TransportEvent>,
    sent: Vec<Frame>,
    handshakes: Vec<Handshake>,
    open: bool,
    open_calls: usize,
    close_calls: usize,
    auto_accept: bool,
}

/// In-memory transport for tests and embedders that bring their own channel.
///
/// The paired [`MemoryRemote`] plays the broker: it accepts or refuses
/// connection attempts, pushes frames and drops the connection.
#[derive(Debug)]
pub struct MemoryTransport {
    link: Rc<RefCell<MemoryLink>>,
}

#[derive(Debug, Clone)]
pub struct MemoryRemote {
    link: Rc<RefCell<MemoryLink>>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryRemote) {
        let link = Rc::new(RefCell::new(MemoryLink::default()));
        (
            Self {
                link: Rc::clone(&link),
            },
            MemoryRemote { link },
        )
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, _endpoint: &Endpoint, handshake: &Handshake) -> Result<()> {
        let mut link = self.link.borrow_mut();
        link.open_calls += 1;
        link.handshakes.push(handshake.clone());
        if link.auto_accept {
            link.open = true;
            link.inbound.push_back(TransportEvent::Opened);
        }
        Ok(())
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        self.link.borrow_mut().inbound.drain(..).collect()
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        let mut link = self.link.borrow_mut();
        if !link.open {
            return Err(SyncError::NotConnected);
        }
        link.sent.push(frame.clone());
        Ok(())
    }

    fn close(&mut self) {
        let mut link = self.link.borrow_mut();
        link.open = false;
        link.close_calls += 1;
        link.inbound.clear();
    }
}

impl MemoryRemote {
    /// Accept every future `open` immediately.
    pub fn set_auto_accept(&self, auto_accept: bool) {
        self.link.borrow_mut().auto_accept = auto_accept;
    }

    pub fn accept(&self) {
        let mut link = self.link.borrow_mut();
        link.open = true;
        link.inbound.push_back(TransportEvent::Opened);
    }

    pub fn refuse(&self, reason: &str) {
        let mut link = self.link.borrow_mut();
        link.open = false;
        link.inbound
            .push_back(TransportEvent::OpenFailed(reason.to_string()));
    }

    pub fn drop_connection(&self, reason: &str) {
        let mut link = self.link.borrow_mut();
        link.open = false;
        link.inbound
            .push_back(TransportEvent::Closed(reason.to_string()));
    }

    pub fn push_frame(&self, frame: &Frame) {
        let bytes = serde_json::to_vec(frame).unwrap_or_default();
        self.push_raw(&bytes);
    }

    pub fn push_event(&self, event: &str, data: serde_json::Value) {
        self.push_frame(&Frame::new(event, Some(data)));
    }

    pub fn push_raw(&self, bytes: &[u8]) {
        self.link
            .borrow_mut()
            .inbound
            .push_back(TransportEvent::Frame(bytes.to_vec()));
    }

    pub fn is_open(&self) -> bool {
        self.link.borrow().open
    }

    pub fn open_calls(&self) -> usize {
        self.link.borrow().open_calls
    }

    pub fn close_calls(&self) -> usize {
        self.link.borrow().close_calls
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.link.borrow().sent.clone()
    }

    pub fn last_handshake(&self) -> Option<Handshake> {
        self.link.borrow().handshakes.last().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::time::Instant;
    use tasksync_protocol::decode_frame;

    fn poll_until<F>(transport: &mut LineTransport, mut done: F) -> Vec<TransportEvent>
    where
        F: FnMut(&[TransportEvent]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            events.extend(transport.poll());
            if done(&events) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        events
    }

    #[test]
    fn endpoint_parses_default_port() {
        let endpoint = Endpoint::parse("tcp://localhost:9000").expect("endpoint");
        assert_eq!(endpoint.host(), "localhost");
        assert_eq!(endpoint.port(), 9000);

        let endpoint = Endpoint::parse("tcp://example.com").expect("endpoint");
        assert_eq!(endpoint.port(), 8001);
    }

    #[test]
    fn endpoint_rejects_schemes_the_line_protocol_cannot_speak() {
        for raw in [
            "http://localhost:8001",
            "https://example.com",
            "ws://example.com",
            "wss://example.com",
            "ftp://example.com",
        ] {
            assert!(
                matches!(Endpoint::parse(raw), Err(SyncError::InvalidEndpoint { .. })),
                "{} should be rejected",
                raw
            );
        }
        assert!(Endpoint::parse("not a url").is_err());
        assert!(Endpoint::parse("tcp://").is_err());
    }

    #[test]
    fn memory_transport_reports_scripted_events() {
        let (mut transport, remote) = MemoryTransport::pair();
        let endpoint = Endpoint::parse("tcp://localhost:8001").unwrap();
        transport
            .open(&endpoint, &Handshake::new("user-1", "device-1"))
            .unwrap();
        assert!(transport.send(&Frame::ping()).is_err());

        remote.accept();
        remote.push_event("pong", serde_json::Value::Null);
        let events = transport.poll();
        assert_eq!(events[0], TransportEvent::Opened);
        assert!(matches!(events[1], TransportEvent::Frame(_)));

        transport.send(&Frame::ping()).unwrap();
        assert_eq!(remote.sent(), vec![Frame::ping()]);
        assert_eq!(remote.last_handshake().unwrap().user_id, "user-1");
    }

    #[test]
    fn line_transport_sends_handshake_and_reads_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut line = String::new();
            reader.read_line(&mut line).expect("read handshake");
            let handshake = decode_frame(line.as_bytes()).expect("handshake frame");

            let mut writer = stream;
            writer
                .write_all(b"{\"event\":\"connected\",\"data\":{\"message\":\"hi\"}}\n\n")
                .unwrap();
            writer.write_all(b"{\"event\":\"pong\"}").unwrap();
            writer.write_all(b"\n").unwrap();
            writer.flush().unwrap();

            let mut ping = String::new();
            reader.read_line(&mut ping).expect("read ping");
            (handshake, ping)
        });

        let endpoint = Endpoint::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        let mut transport = LineTransport::new();
        transport
            .open(&endpoint, &Handshake::new("user-1", "device-1"))
            .unwrap();

        let events = poll_until(&mut transport, |events| {
            events
                .iter()
                .filter(|event| matches!(event, TransportEvent::Frame(_)))
                .count()
                >= 2
        });
        assert_eq!(events[0], TransportEvent::Opened);
        let frames: Vec<String> = events
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Frame(bytes) => Some(decode_frame(bytes).unwrap().event),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec!["connected".to_string(), "pong".to_string()]);

        transport.send(&Frame::ping()).expect("send ping");
        let (handshake, ping) = server.join().unwrap();
        assert_eq!(handshake.event, "handshake");
        assert_eq!(
            handshake.data.unwrap().get("device_id").and_then(|v| v.as_str()),
            Some("device-1")
        );
        assert_eq!(decode_frame(ping.as_bytes()).unwrap().event, "ping");

        let events = poll_until(&mut transport, |events| {
            events
                .iter()
                .any(|event| matches!(event, TransportEvent::Closed(_)))
        });
        assert!(events
            .iter()
            .any(|event| matches!(event, TransportEvent::Closed(_))));
    }

    #[test]
    fn line_transport_reports_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        let mut transport = LineTransport::new().with_connect_timeout(Duration::from_millis(200));
        transport
            .open(&endpoint, &Handshake::new("user-1", "device-1"))
            .unwrap();
        assert!(transport.send(&Frame::ping()).is_err());

        let events = poll_until(&mut transport, |events| !events.is_empty());
        assert!(matches!(events.as_slice(), [TransportEvent::OpenFailed(_)]));
        assert!(transport.send(&Frame::ping()).is_err());
    }

    #[test]
    fn line_transport_open_hands_connect_to_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();

        let endpoint = Endpoint::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        let mut transport = LineTransport::new();
        transport
            .open(&endpoint, &Handshake::new("user-1", "device-1"))
            .unwrap();
        assert!(transport.stream.is_none());
        assert!(transport.connecting.is_some());

        let (_stream, _) = listener.accept().expect("accept");
        let events = poll_until(&mut transport, |events| !events.is_empty());
        assert_eq!(events, vec![TransportEvent::Opened]);
        assert!(transport.connecting.is_none());
    }

    #[test]
    fn line_transport_keeps_framing_under_backpressure() {
        const FRAMES: usize = 24;
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            // Hold off reading until the client has queued everything.
            release_rx.recv().expect("release");
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).expect("read handshake");

            let mut decoded = 0;
            for _ in 0..FRAMES {
                line.clear();
                reader.read_line(&mut line).expect("read frame");
                let frame = decode_frame(line.as_bytes()).expect("whole frame");
                assert_eq!(frame.event, "bulk");
                decoded += 1;
            }
            decoded
        });

        let endpoint = Endpoint::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        let mut transport = LineTransport::new();
        transport
            .open(&endpoint, &Handshake::new("user-1", "device-1"))
            .unwrap();
        let events = poll_until(&mut transport, |events| !events.is_empty());
        assert_eq!(events, vec![TransportEvent::Opened]);

        let padding = "x".repeat(128 * 1024);
        let started = Instant::now();
        for index in 0..FRAMES {
            let frame = Frame::new(
                "bulk",
                Some(serde_json::json!({ "index": index, "padding": padding })),
            );
            transport.send(&frame).expect("queue frame");
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        release_tx.send(()).expect("release server");

        let deadline = Instant::now() + Duration::from_secs(10);
        while transport.pending_write_bytes() > 0 && Instant::now() < deadline {
            transport.poll();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(transport.pending_write_bytes(), 0);
        assert_eq!(server.join().unwrap(), FRAMES);
    }
}
