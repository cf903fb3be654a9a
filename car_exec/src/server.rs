//! # Car Server
//!
//! The server's reactor owns the listening socket and every open connection. It runs on a single
//! thread and only ever does short, bounded work per connection:
//!
//! - accepting a connection starts the WebSocket upgrade, which is then advanced a step on every
//!   pass without waiting on the peer, and dropped if it takes longer than the handshake timeout,
//! - the upgrade is refused with a 404 for unknown paths and a 503 when the connection limit is
//!   reached or, for streaming and telemetry, when no pool worker is free,
//! - control messages are handed to the command ingress,
//! - a streaming or telemetry connection is given a session ticket, which a pool worker hands to
//!   the matching session task,
//! - when a session connection closes (or drops) the reactor performs the stop handshake and
//!   only then answers the close.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, atomic::{AtomicBool, AtomicUsize, Ordering}},
    thread,
    time::Duration
};
use comms_if::net::{
    self, AcceptError, ConnId, Connection, Endpoint, Inbound, MonitoredConnection,
    PendingUpgrade, Rejection, SocketOptions, Upgrade
};
use log::{debug, info, warn};

use crate::{
    cmd_ingress::CmdIngress,
    session::{self, Handoff, StopOutcome, StopRequester},
    worker_pool::{Admission, Admitter, WorkerPool}
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: String,

    /// Maximum number of open connections, further upgrades are refused as busy
    pub max_connections: usize,

    /// Maximum number of handshakes in progress, further TCP connections are dropped
    pub max_pending_upgrades: usize,

    /// Options applied to every accepted connection
    pub socket_options: SocketOptions,

    /// Sleep between reactor passes that found nothing to do
    pub idle_sleep: Duration
}

pub struct CarServer {
    listener: TcpListener,
    config: ServerConfig,
    ingress: CmdIngress,
    pool: WorkerPool,
    stream_handoff: Handoff,
    tm_handoff: Handoff,
    conns: BTreeMap<ConnId, OpenConn>,
    open: Arc<AtomicUsize>,
    pending: Vec<(SocketAddr, PendingUpgrade<Option<Admission>>)>,
    next_id: u64
}

struct OpenConn {
    conn: Arc<MonitoredConnection>,
    role: Role
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

enum Role {
    Control,
    Session(StopRequester)
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("Could not bind to {0}: {1}")]
    Bind(String, io::Error),

    #[error("Could not configure the listener: {0}")]
    ListenerConfig(io::Error)
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CarServer {
    /// Bind the server's listening socket.
    pub fn new(
        config: ServerConfig,
        ingress: CmdIngress,
        pool: WorkerPool,
        stream_handoff: Handoff,
        tm_handoff: Handoff
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .map_err(|e| ServerError::Bind(config.bind_addr.clone(), e))?;
        listener.set_nonblocking(true)
            .map_err(ServerError::ListenerConfig)?;

        Ok(Self {
            listener,
            config,
            ingress,
            pool,
            stream_handoff,
            tm_handoff,
            conns: BTreeMap::new(),
            open: Arc::new(AtomicUsize::new(0)),
            pending: Vec::new(),
            next_id: 0
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of open connections.
    pub fn num_connections(&self) -> usize {
        self.conns.len()
    }

    /// Number of upgrades still waiting on the peer.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn ingress(&self) -> &CmdIngress {
        &self.ingress
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run the reactor forever.
    pub fn run(&mut self) {
        let never = AtomicBool::new(false);
        self.run_until(&never);
    }

    /// Run the reactor until `shutdown` is set, then close every connection.
    pub fn run_until(&mut self, shutdown: &AtomicBool) {
        match self.local_addr() {
            Ok(addr) => info!("Car server listening on {}", addr),
            Err(e) => warn!("Car server listening on an unknown address: {}", e)
        }

        while !shutdown.load(Ordering::Relaxed) {
            if !self.poll_once() {
                thread::sleep(self.config.idle_sleep);
            }
        }

        info!("Car server shutting down, closing {} connections", self.conns.len());
        self.pending.clear();
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            self.teardown(id, false);
        }
    }

    /// Make one pass over the listener and every open connection. Returns `true` if anything
    /// happened.
    pub fn poll_once(&mut self) -> bool {
        let mut active = false;

        // New connections
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    active = true;
                    self.on_accept(stream, addr);
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Could not accept a connection: {}", e);
                    break
                }
            }
        }

        // Upgrades in progress
        for (addr, upgrade) in std::mem::take(&mut self.pending) {
            let id = upgrade.id();
            active |= self.on_upgrade(id, addr, upgrade.resume());
        }

        // Inbound messages
        let mut closed = Vec::new();

        for (id, open) in self.conns.iter() {
            match open.conn.poll() {
                Ok(None) => (),
                Ok(Some(Inbound::Close)) => {
                    active = true;
                    debug!("Connection {} sent a close", id);
                    closed.push((*id, true));
                },
                Ok(Some(msg)) => {
                    active = true;
                    self.on_message(*id, &open.role, msg);
                },
                Err(e) => {
                    active = true;
                    info!("Connection {} dropped: {}", id, e);
                    closed.push((*id, false));
                }
            }
        }

        for (id, clean) in closed {
            self.teardown(id, clean);
        }

        active
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = ConnId(self.next_id);
        self.next_id += 1;

        if self.pending.len() >= self.config.max_pending_upgrades {
            warn!("Dropping connection {} from {}, too many handshakes in progress", id, addr);
            return
        }

        let gate = admission_gate(
            self.open.clone(),
            self.config.max_connections,
            self.pool.admitter()
        );

        let upgrade = net::accept(stream, id, &self.config.socket_options, gate);
        self.on_upgrade(id, addr, upgrade);
    }

    /// Handle the latest step of an upgrade. Returns `true` unless it is still waiting on the
    /// peer.
    fn on_upgrade(
        &mut self,
        id: ConnId,
        addr: SocketAddr,
        upgrade: Result<Upgrade<Option<Admission>>, AcceptError>
    ) -> bool {
        match upgrade {
            Ok(Upgrade::Pending(p)) => {
                self.pending.push((addr, p));
                false
            },
            Ok(Upgrade::Open(conn, admission)) => {
                self.on_open(conn, admission, addr);
                true
            },
            Err(AcceptError::Rejected(r)) => {
                info!("Refused connection {} from {}: {:?}", id, addr, r);
                true
            },
            Err(e) => {
                warn!("Could not accept connection {} from {}: {}", id, addr, e);
                true
            }
        }
    }

    fn on_open(&mut self, conn: MonitoredConnection, admission: Option<Admission>, addr: SocketAddr) {
        let id = conn.id();
        let conn = Arc::new(conn);
        let endpoint = conn.endpoint();

        let role = match (self.handoff_for(endpoint), admission) {
            (None, _) => Role::Control,
            (Some(handoff), Some(admission)) => {
                let handoff = handoff.clone();
                let (ticket, requester, waiter) = session::ticket(conn.clone());

                let submitted = admission.submit(move || {
                    if let Err(e) = handoff.attach(ticket, waiter) {
                        warn!("Could not hand the connection to the {} session: {}", handoff.name(), e);
                    }
                });

                if let Err(e) = submitted {
                    // The job and its ticket were dropped, nothing to stop
                    warn!("Could not start a session for connection {}: {}", id, e);
                    conn.close_busy().ok();
                    return
                }

                Role::Session(requester)
            },
            (Some(_), None) => {
                warn!("Session connection {} was accepted without a worker, closing it", id);
                conn.close_busy().ok();
                return
            }
        };

        info!("Connection {} from {} opened on {}", id, addr, endpoint.path());
        self.conns.insert(id, OpenConn { conn, role });
        self.open.store(self.conns.len(), Ordering::SeqCst);
    }

    fn on_message(&self, id: ConnId, role: &Role, msg: Inbound) {
        match (role, msg) {
            (Role::Control, Inbound::Text(text)) => {
                // Invalid messages are logged by the ingress and dropped
                self.ingress.handle_text(&text).ok();
            },
            (Role::Control, Inbound::Binary(data)) => {
                warn!("Connection {}: {}", id, self.ingress.handle_binary(&data));
            },
            (Role::Session(_), _) => {
                warn!("Connection {}: ignoring inbound message on a session endpoint", id);
            },
            (_, Inbound::Close) => ()
        }
    }

    /// Remove a connection, stopping its session first if it has one. If the peer sent a close
    /// the reply goes out only after the session has let go of the connection.
    fn teardown(&mut self, id: ConnId, clean: bool) {
        let open = match self.conns.remove(&id) {
            Some(o) => o,
            None => return
        };
        self.open.store(self.conns.len(), Ordering::SeqCst);

        if let Role::Session(requester) = open.role {
            match requester.stop() {
                StopOutcome::Cancelled => debug!("Connection {} closed while queued", id),
                StopOutcome::Acknowledged => debug!("Session on connection {} acknowledged the stop", id),
                StopOutcome::AlreadyFinished => debug!("Session on connection {} had already ended", id)
            }
        }

        if clean {
            if let Err(e) = open.conn.acknowledge_close() {
                debug!("Could not complete the close of connection {}: {}", id, e);
            }
        }

        info!("Connection {} closed", id);
    }

    fn handoff_for(&self, endpoint: Endpoint) -> Option<&Handoff> {
        match endpoint {
            Endpoint::Control => None,
            Endpoint::Stream => Some(&self.stream_handoff),
            Endpoint::Telemetry => Some(&self.tm_handoff)
        }
    }
}

impl ServerConfig {
    /// Default limits for a pool of `num_workers` workers: one connection per worker plus the
    /// control connection.
    pub fn for_workers(bind_addr: &str, num_workers: usize) -> Self {
        Self {
            bind_addr: bind_addr.to_owned(),
            max_connections: num_workers + 1,
            max_pending_upgrades: 8,
            socket_options: SocketOptions::default(),
            idle_sleep: Duration::from_millis(2)
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Admission check run once an upgrade request has been read. Session endpoints take a worker
/// permit, every endpoint is refused once `max_connections` are open.
fn admission_gate(
    open: Arc<AtomicUsize>,
    max_connections: usize,
    admitter: Admitter
) -> impl FnOnce(Endpoint) -> Result<Option<Admission>, Rejection> + Send + 'static {
    move |endpoint| {
        if open.load(Ordering::SeqCst) >= max_connections {
            return Err(Rejection::Busy)
        }

        if endpoint.is_session() {
            admitter.try_admit().map(Some).map_err(|_| Rejection::Busy)
        }
        else {
            Ok(None)
        }
    }
}
