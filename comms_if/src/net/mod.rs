//! # Network Module
//!
//! This module provides networking abstractions over WebSockets, the transport chosen for the
//! car's operator links.
//!
//! Every operator link is a WebSocket over plain TCP. The request path selects the endpoint:
//!
//! - `/` (or `/control`): control messages from the operator to the car,
//! - `/stream`: binary JPEG frames from the car to the operator,
//! - `/telemetry`: JSON telemetry records from the car to the operator.
//!
//! The opening handshake runs on a nonblocking stream and is driven step by step with
//! [`PendingUpgrade::resume`], so a peer that never completes it cannot stall the caller.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    fmt,
    io,
    net::{SocketAddr, TcpStream},
    sync::{Arc, Mutex, MutexGuard, atomic::{AtomicBool, Ordering}},
    time::{Duration, Instant}
};
use tungstenite::{
    HandshakeError, Message, WebSocket,
    handshake::{
        MidHandshake,
        server::{Callback, ErrorResponse, Request, Response, ServerHandshake}
    },
    http::StatusCode,
    protocol::{CloseFrame, frame::coding::CloseCode}
};

// Export tungstenite
pub use tungstenite;

// ------------------------------------------------------------------------------------------------
// MACROS
// ------------------------------------------------------------------------------------------------

macro_rules! set_sockopts {
    ($socket:expr, $(($opt:ident, $val:expr)),+) => {
        $(
            $socket.$opt($val)
                .map_err(|e| AcceptError::SocketOptionError(stringify!($opt).into(), e))?;
        )+
    };
}

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

type AdmitFn<A> = Box<dyn FnOnce(Endpoint) -> Result<A, Rejection> + Send>;

/// Outcome of the admission check, filled in once the request headers have been read.
type Verdict<A> = Arc<Mutex<Option<Result<(Endpoint, A), Rejection>>>>;

type Handshake<A> = MidHandshake<ServerHandshake<TcpStream, Gate<A>>>;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// An open operator connection that the car can push data down.
///
/// Sessions only ever see this trait so that they can be driven by an in-memory connection in
/// tests.
pub trait Connection: Send + Sync {
    /// Identifier of the connection, unique for the lifetime of the server.
    fn id(&self) -> ConnId;

    /// Send a binary message.
    fn send_binary(&self, data: &[u8]) -> Result<(), ConnError>;

    /// Send a text message.
    fn send_text(&self, text: &str) -> Result<(), ConnError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

/// A WebSocket connection which is monitored, providing additional information.
///
/// The socket is shared between the server's reactor, which polls it for inbound messages, and
/// at most one session worker, which pushes outbound data down it. Access is serialised by a
/// mutex; the reactor's poll holds it for at most one read timeout.
pub struct MonitoredConnection {
    id: ConnId,

    endpoint: Endpoint,

    peer: Option<SocketAddr>,

    socket: Mutex<WebSocket<TcpStream>>,

    connected: AtomicBool,

    /// Set once the peer's close frame has been read, until the close is acknowledged
    closing: AtomicBool
}

/// An opening handshake that is waiting on the peer.
pub struct PendingUpgrade<A> {
    ctx: UpgradeCtx<A>,
    handshake: Handshake<A>
}

struct UpgradeCtx<A> {
    id: ConnId,
    peer: Option<SocketAddr>,
    options: SocketOptions,
    started: Instant,
    verdict: Verdict<A>
}

/// Routes and admits an upgrade request from inside the handshake.
struct Gate<A> {
    admit: AdmitFn<A>,
    verdict: Verdict<A>
}

/// Represents options which are set on the TCP stream underlying a connection.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Maximum time allowed for the peer to complete the opening handshake.
    ///
    /// The default value is 2 seconds.
    pub handshake_timeout: Duration,

    /// Maximum time a single poll of the connection blocks waiting for an inbound message. Keep
    /// this short, the socket is locked while polling.
    ///
    /// The default value is 5 milliseconds.
    pub poll_timeout: Duration,

    /// Maximum time a send blocks before the connection is considered dead.
    ///
    /// The default value is 5 seconds.
    pub write_timeout: Duration,

    /// `TCP_NODELAY`: disable Nagle's algorithm
    pub nodelay: bool
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Progress of an opening handshake.
pub enum Upgrade<A> {
    /// The peer has not finished its side yet
    Pending(PendingUpgrade<A>),

    /// The connection is open, with the value returned by the admission check
    Open(MonitoredConnection, A)
}

/// The endpoints served by the car.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Control,
    Stream,
    Telemetry
}

/// A message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Close
}

/// Reasons an upgrade request may be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The request path does not name an endpoint
    NotFound,

    /// No session worker is free, or the connection limit is reached
    Busy
}

#[derive(thiserror::Error, Debug)]
pub enum ConnError {
    #[error("The connection is closed")]
    Closed,

    #[error("The peer is closing the connection")]
    Closing,

    #[error("Connection I/O error: {0}")]
    Io(io::Error),

    #[error("WebSocket protocol error: {0}")]
    Protocol(String),

    #[error("The connection's socket lock is poisoned")]
    Poisoned
}

#[derive(thiserror::Error, Debug)]
pub enum AcceptError {
    #[error("Could not set the {0} socket option: {1}")]
    SocketOptionError(String, io::Error),

    #[error("Upgrade request refused: {0:?}")]
    Rejected(Rejection),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("WebSocket handshake not completed within {0:?}")]
    Timeout(Duration)
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<A> PendingUpgrade<A> {
    pub fn id(&self) -> ConnId {
        self.ctx.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.ctx.peer
    }

    /// Continue the handshake with whatever the peer has sent since the last attempt.
    ///
    /// Fails with [`AcceptError::Timeout`] once the handshake timeout has passed.
    pub fn resume(self) -> Result<Upgrade<A>, AcceptError> {
        let timeout = self.ctx.options.handshake_timeout;
        if self.ctx.started.elapsed() > timeout {
            return Err(AcceptError::Timeout(timeout))
        }

        self.ctx.progress(self.handshake.handshake())
    }
}

impl<A> UpgradeCtx<A> {
    fn progress(
        self,
        result: Result<WebSocket<TcpStream>, HandshakeError<ServerHandshake<TcpStream, Gate<A>>>>
    ) -> Result<Upgrade<A>, AcceptError> {
        match result {
            Ok(ws) => self.open(ws),
            Err(HandshakeError::Interrupted(handshake)) => Ok(Upgrade::Pending(PendingUpgrade {
                ctx: self,
                handshake
            })),
            Err(HandshakeError::Failure(e)) => match self.take_verdict() {
                Some(Err(r)) => Err(AcceptError::Rejected(r)),
                _ => Err(AcceptError::Handshake(e.to_string()))
            }
        }
    }

    fn open(self, ws: WebSocket<TcpStream>) -> Result<Upgrade<A>, AcceptError> {
        // If the handshake succeeded the gate admitted the request, but handle the odd case of
        // the admission value going missing as a failed handshake rather than panicking.
        let (endpoint, value) = match self.take_verdict() {
            Some(Ok(a)) => a,
            _ => return Err(AcceptError::Handshake("request was not admitted".into()))
        };

        set_sockopts!(
            ws.get_ref(),
            (set_nonblocking, false),
            (set_read_timeout, Some(self.options.poll_timeout)),
            (set_write_timeout, Some(self.options.write_timeout))
        );

        Ok(Upgrade::Open(
            MonitoredConnection {
                id: self.id,
                endpoint,
                peer: self.peer,
                socket: Mutex::new(ws),
                connected: AtomicBool::new(true),
                closing: AtomicBool::new(false)
            },
            value
        ))
    }

    fn take_verdict(&self) -> Option<Result<(Endpoint, A), Rejection>> {
        self.verdict.lock().ok().and_then(|mut v| v.take())
    }
}

impl<A> Callback for Gate<A> {
    fn on_request(self, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
        let verdict = match Endpoint::from_path(request.uri().path()) {
            Some(endpoint) => (self.admit)(endpoint).map(|a| (endpoint, a)),
            None => Err(Rejection::NotFound)
        };

        let reply = match verdict {
            Ok(_) => Ok(response),
            Err(ref r) => Err(r.response())
        };

        if let Ok(mut v) = self.verdict.lock() {
            *v = Some(verdict);
        }

        reply
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Endpoint {
    /// Resolve a request path into an endpoint.
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/" | "/control" => Some(Endpoint::Control),
            "/stream" => Some(Endpoint::Stream),
            "/telemetry" => Some(Endpoint::Telemetry),
            _ => None
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Control => "/",
            Endpoint::Stream => "/stream",
            Endpoint::Telemetry => "/telemetry"
        }
    }

    /// Streaming and telemetry connections are served by a session worker.
    pub fn is_session(&self) -> bool {
        !matches!(self, Endpoint::Control)
    }
}

impl Rejection {
    fn status(&self) -> StatusCode {
        match self {
            Rejection::NotFound => StatusCode::NOT_FOUND,
            Rejection::Busy => StatusCode::SERVICE_UNAVAILABLE
        }
    }

    fn body(&self) -> &'static str {
        match self {
            Rejection::NotFound => "no such endpoint",
            Rejection::Busy => "no workers available. server busy"
        }
    }

    fn response(&self) -> ErrorResponse {
        let mut resp = ErrorResponse::new(Some(self.body().to_string()));
        *resp.status_mut() = self.status();
        resp
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(2),
            poll_timeout: Duration::from_millis(5),
            write_timeout: Duration::from_secs(5),
            nodelay: true
        }
    }
}

impl From<tungstenite::Error> for ConnError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed => ConnError::Closed,
            tungstenite::Error::Io(e) => ConnError::Io(e),
            e => ConnError::Protocol(e.to_string())
        }
    }
}

impl MonitoredConnection {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Returns `true` until the close completes or an I/O error occurs.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Returns `true` once the peer has sent a close frame which has not been acknowledged yet.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Poll the connection for an inbound message.
    ///
    /// Blocks for at most the poll timeout, returning `Ok(None)` if nothing arrived. Control
    /// frames (ping/pong) are answered internally and also return `Ok(None)`.
    pub fn poll(&self) -> Result<Option<Inbound>, ConnError> {
        let mut ws = self.lock()?;

        match ws.read() {
            Ok(Message::Text(t)) => Ok(Some(Inbound::Text(t))),
            Ok(Message::Binary(b)) => Ok(Some(Inbound::Binary(b))),
            Ok(Message::Close(_)) => {
                // Stored under the lock, so no send can slip in between the read and the flag
                self.closing.store(true, Ordering::Relaxed);
                Ok(Some(Inbound::Close))
            },
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(ref e)) if is_timeout(e) => Ok(None),
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Complete a close started by the peer by sending the close reply.
    pub fn acknowledge_close(&self) -> Result<(), ConnError> {
        self.connected.store(false, Ordering::Relaxed);
        self.closing.store(false, Ordering::Relaxed);
        let mut ws = self.lock()?;

        match ws.flush() {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into())
        }
    }

    /// Start a close from the car's side, used when a session could not be handed to a worker.
    pub fn close_busy(&self) -> Result<(), ConnError> {
        self.connected.store(false, Ordering::Relaxed);
        let mut ws = self.lock()?;

        let frame = CloseFrame {
            code: CloseCode::Again,
            reason: Rejection::Busy.body().into()
        };

        match ws.close(Some(frame)).and_then(|_| ws.flush()) {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into())
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, WebSocket<TcpStream>>, ConnError> {
        self.socket.lock().map_err(|_| ConnError::Poisoned)
    }

    fn send(&self, msg: Message) -> Result<(), ConnError> {
        let mut ws = self.lock()?;

        if self.is_closing() {
            return Err(ConnError::Closing)
        }
        if !self.is_connected() {
            return Err(ConnError::Closed)
        }

        ws.send(msg).map_err(|e| {
            self.connected.store(false, Ordering::Relaxed);
            ConnError::from(e)
        })
    }
}

impl Connection for MonitoredConnection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn send_binary(&self, data: &[u8]) -> Result<(), ConnError> {
        self.send(Message::Binary(data.to_vec()))
    }

    fn send_text(&self, text: &str) -> Result<(), ConnError> {
        self.send(Message::Text(text.to_owned()))
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Start the WebSocket opening handshake on a freshly accepted stream.
///
/// The stream is switched to nonblocking mode, so this only goes as far as the bytes already
/// received allow. Unless the handshake completes straight away a [`PendingUpgrade`] is returned,
/// to be resumed once the peer has sent more.
///
/// `admit` is called with the requested endpoint before the upgrade is answered. If it returns a
/// [`Rejection`] the peer receives the matching HTTP error instead of an upgrade, otherwise its
/// value is returned alongside the open connection.
pub fn accept<A, F>(
    stream: TcpStream,
    id: ConnId,
    options: &SocketOptions,
    admit: F
) -> Result<Upgrade<A>, AcceptError>
where
    A: Send + 'static,
    F: FnOnce(Endpoint) -> Result<A, Rejection> + Send + 'static
{
    let peer = stream.peer_addr().ok();

    set_sockopts!(
        stream,
        (set_nonblocking, true),
        (set_nodelay, options.nodelay)
    );

    let verdict: Verdict<A> = Arc::new(Mutex::new(None));
    let gate = Gate {
        admit: Box::new(admit),
        verdict: verdict.clone()
    };

    let ctx = UpgradeCtx {
        id,
        peer,
        options: options.clone(),
        started: Instant::now(),
        verdict
    };

    ctx.progress(tungstenite::accept_hdr(stream, gate))
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_endpoint_paths() {
        assert_eq!(Endpoint::from_path("/"), Some(Endpoint::Control));
        assert_eq!(Endpoint::from_path("/control"), Some(Endpoint::Control));
        assert_eq!(Endpoint::from_path("/stream"), Some(Endpoint::Stream));
        assert_eq!(Endpoint::from_path("/telemetry"), Some(Endpoint::Telemetry));
        assert_eq!(Endpoint::from_path("/status"), None);

        assert!(!Endpoint::Control.is_session());
        assert!(Endpoint::Stream.is_session());
    }

    #[test]
    fn test_rejection_response() {
        let resp = Rejection::Busy.response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.body().as_deref(), Some("no workers available. server busy"));

        assert_eq!(Rejection::NotFound.response().status(), StatusCode::NOT_FOUND);
    }

    fn listener() -> (std::net::TcpListener, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    /// Resume an upgrade until it is no longer pending.
    fn drive<A>(mut upgrade: Result<Upgrade<A>, AcceptError>) -> Result<(MonitoredConnection, A), AcceptError> {
        loop {
            match upgrade? {
                Upgrade::Open(conn, a) => return Ok((conn, a)),
                Upgrade::Pending(p) => {
                    std::thread::sleep(Duration::from_millis(1));
                    upgrade = p.resume();
                }
            }
        }
    }

    #[test]
    fn test_silent_peer_times_out() {
        let (listener, addr) = listener();
        let _client = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();

        let options = SocketOptions {
            handshake_timeout: Duration::from_millis(200),
            ..SocketOptions::default()
        };

        // Nothing has been sent, so the upgrade returns straight away without completing
        let start = Instant::now();
        let pending = match accept(stream, ConnId(1), &options, |_| Ok(())) {
            Ok(Upgrade::Pending(p)) => p,
            _ => panic!("expected a pending upgrade")
        };
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(pending.id(), ConnId(1));

        // Still waiting on the peer, then given up on
        let pending = match pending.resume() {
            Ok(Upgrade::Pending(p)) => p,
            _ => panic!("expected the upgrade to still be pending")
        };
        std::thread::sleep(Duration::from_millis(250));
        assert!(matches!(pending.resume(), Err(AcceptError::Timeout(_))));
    }

    #[test]
    fn test_upgrade_completes_incrementally() {
        let (listener, addr) = listener();
        let client = std::thread::spawn(move || {
            let (mut ws, _) = tungstenite::connect(format!("ws://{}/telemetry", addr)).unwrap();
            ws.send(Message::Text("hello".into())).unwrap();
            ws
        });

        let (stream, _) = listener.accept().unwrap();
        let upgrade = accept(stream, ConnId(2), &SocketOptions::default(), |endpoint| Ok(endpoint));
        let (conn, admitted) = drive(upgrade).unwrap();

        assert_eq!(admitted, Endpoint::Telemetry);
        assert_eq!(conn.endpoint(), Endpoint::Telemetry);

        let _ws = client.join().unwrap();
        let start = Instant::now();
        loop {
            if let Some(msg) = conn.poll().unwrap() {
                assert_eq!(msg, Inbound::Text("hello".into()));
                break
            }
            assert!(start.elapsed() < Duration::from_secs(2), "no message received");
        }
    }

    #[test]
    fn test_unknown_path_is_rejected() {
        let (listener, addr) = listener();
        let client = std::thread::spawn(move || {
            tungstenite::connect(format!("ws://{}/video", addr)).err()
        });

        let (stream, _) = listener.accept().unwrap();
        let upgrade = accept(stream, ConnId(3), &SocketOptions::default(), |_| Ok(()));
        assert!(matches!(drive(upgrade), Err(AcceptError::Rejected(Rejection::NotFound))));

        match client.join().unwrap() {
            Some(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), StatusCode::NOT_FOUND),
            other => panic!("expected an HTTP refusal, got {:?}", other)
        }
    }
}
