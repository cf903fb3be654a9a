//! # Sessions
//!
//! A session attaches one network consumer to a data producing task. Streaming and telemetry
//! sessions share the same machinery, parameterised by a [`SessionKind`]:
//!
//! ```text
//! Idle --ticket attached--> Active --stop / send failure--> Draining --> Idle
//! ```
//!
//! The session task is parked on a single slot [`Handoff`] queue. Pool workers push tickets into
//! it and then wait for the ticket to finish, so each queued or active session occupies one
//! worker. Because the slot holds one ticket, sessions of the same kind are served strictly one
//! after the other and never interleave on a connection.
//!
//! While active the task pops items from its source channel with a bounded wait, checks for a
//! stop before every send, and forwards the item. Items are dropped (frames returned to their
//! pool) before the stop is acknowledged.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Session tickets and the two-phase stop handshake.
pub mod handshake;

/// Video streaming session.
pub mod stream;

/// Telemetry session.
pub mod tm;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    io,
    sync::{Arc, atomic::{AtomicU8, AtomicU64, Ordering}},
    thread::{self, JoinHandle},
    time::Duration
};
use comms_if::net::{ConnError, Connection};
use log::{debug, info, trace, warn};

use crate::channel::{self, ChanRx, ChanTx, ChannelError, PushError};
use handshake::{SessionTicket, TicketWaiter};

pub use handshake::{ticket, StopOutcome, StopRequester, TicketPhase};
pub use stream::StreamSession;
pub use tm::TelemetrySession;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Interval at which a worker blocked on a full handoff slot checks its ticket for cancellation.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// What a session forwards and how it controls its producer.
pub trait SessionKind: Send + 'static {
    /// Items popped from the source channel.
    type Item: Send + 'static;

    /// Name used in logs and thread names.
    const NAME: &'static str;

    /// Engage the upstream producer, called when a ticket is attached.
    fn arm(&mut self);

    /// Disengage the upstream producer, called before the stop is acknowledged.
    fn disarm(&mut self);

    /// Whether an item popped while active should be forwarded.
    fn admit(&self, _item: &Self::Item) -> bool {
        true
    }

    /// Send one item over the connection.
    fn forward(&self, conn: &dyn Connection, item: &Self::Item) -> Result<(), ConnError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Sending side of a session task's single slot handoff queue.
#[derive(Clone)]
pub struct Handoff {
    name: &'static str,
    tx: ChanTx<SessionTicket>
}

/// Observable state of a session task.
#[derive(Clone)]
pub struct SessionStatus {
    state: Arc<AtomicU8>,
    served: Arc<AtomicU64>
}

/// The long lived task serving sessions of one kind.
pub struct SessionTask<K: SessionKind> {
    kind: K,
    source: ChanRx<K::Item>,
    handoff_rx: ChanRx<SessionTicket>,
    status: SessionStatus,
    poll: Duration
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,

    /// Forwarding has ended: the item in hand is being released and the producer disarmed
    Draining
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Could not create the session handoff queue: {0}")]
    Channel(#[from] ChannelError),

    #[error("Could not spawn the session task: {0}")]
    Spawn(io::Error)
}

/// Why the forwarding loop ended.
enum Ending {
    StopRequested,
    SendFailed(ConnError),
    SourceClosed
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Create a session task forwarding items from `source`, along with its handoff queue and
/// status handle. `poll` bounds the time a stop can go unnoticed while the source is quiet.
pub fn session<K: SessionKind>(
    kind: K,
    source: ChanRx<K::Item>,
    poll: Duration
) -> Result<(SessionTask<K>, Handoff, SessionStatus), ChannelError> {
    let (tx, handoff_rx) = channel::bounded(K::NAME, 1)?;
    let status = SessionStatus::new();

    Ok((
        SessionTask {
            kind,
            source,
            handoff_rx,
            status: status.clone(),
            poll
        },
        Handoff { name: K::NAME, tx },
        status
    ))
}

/// Create and spawn a session task on its own named thread.
pub fn spawn<K: SessionKind>(
    kind: K,
    source: ChanRx<K::Item>,
    poll: Duration
) -> Result<(Handoff, SessionStatus, JoinHandle<()>), SessionError> {
    let (task, handoff, status) = session(kind, source, poll)?;

    let handle = thread::Builder::new()
        .name(format!("{}_session", K::NAME))
        .spawn(move || task.run())
        .map_err(SessionError::Spawn)?;

    Ok((handoff, status, handle))
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Handoff {
    /// Hand a ticket over to the session task, then block until the session is over.
    ///
    /// Runs on a pool worker. Blocks while another session of the same kind holds the slot, or
    /// until the ticket is cancelled. A cancelled ticket already in the slot is left there for
    /// the session task to discard.
    pub fn attach(&self, mut ticket: SessionTicket, waiter: TicketWaiter) -> Result<(), ChannelError> {
        let conn_id = ticket.conn().id();
        debug!("Queuing connection {} for the {} session", conn_id, self.name);

        loop {
            // A disconnected slot drops the ticket with the error, which finishes it
            match self.tx.push_timeout(ticket, CANCEL_CHECK_INTERVAL) {
                Ok(()) => break,
                Err(PushError::Timeout(t)) => {
                    if t.phase() == TicketPhase::Cancelled {
                        debug!(
                            "Connection {} cancelled while waiting for the {} slot",
                            conn_id, self.name
                        );
                        return Ok(())
                    }
                    ticket = t;
                },
                Err(_) => return Err(ChannelError::Disconnected(self.tx.name()))
            }
        }

        waiter.wait();

        debug!("Connection {} released from the {} session", conn_id, self.name);
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl SessionStatus {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(SessionState::Idle as u8)),
            served: Arc::new(AtomicU64::new(0))
        }
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            1 => SessionState::Active,
            2 => SessionState::Draining,
            _ => SessionState::Idle
        }
    }

    /// Number of sessions that have been attached so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    fn set(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl<K: SessionKind> SessionTask<K> {
    /// Serve sessions until every handoff sender is gone.
    pub fn run(mut self) {
        info!("{} session task started", K::NAME);

        while let Ok(ticket) = self.handoff_rx.pop() {
            self.serve(ticket);
        }

        info!("{} session task stopped, handoff queue closed", K::NAME);
    }

    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    fn serve(&mut self, ticket: SessionTicket) {
        let conn_id = ticket.conn().id();

        if !ticket.attach() {
            debug!("Connection {} closed before its {} session started", conn_id, K::NAME);
            return
        }

        info!("{} session attached to connection {}", K::NAME, conn_id);
        self.status.served.fetch_add(1, Ordering::SeqCst);
        self.status.set(SessionState::Active);
        self.kind.arm();

        // Leaves the status at Draining, with any item in hand already released
        let ending = self.forward_until_stopped(&ticket);

        self.kind.disarm();
        self.status.set(SessionState::Idle);

        match ending {
            Ending::StopRequested => {
                info!("{} session on connection {} stopped", K::NAME, conn_id);
                ticket.finish(true);
            },
            Ending::SendFailed(e) => {
                warn!("{} session on connection {} lost: {}", K::NAME, conn_id, e);
                ticket.finish(false);
            },
            Ending::SourceClosed => {
                warn!("{} session source closed, dropping connection {}", K::NAME, conn_id);
                ticket.finish(false);
            }
        }
    }

    fn forward_until_stopped(&mut self, ticket: &SessionTicket) -> Ending {
        loop {
            let item = match self.source.pop_timeout(self.poll) {
                Ok(Some(item)) => item,
                Ok(None) => {
                    if ticket.stop_requested() {
                        self.status.set(SessionState::Draining);
                        return Ending::StopRequested
                    }
                    continue
                },
                Err(_) => {
                    self.status.set(SessionState::Draining);
                    return Ending::SourceClosed
                }
            };

            if ticket.stop_requested() {
                self.status.set(SessionState::Draining);
                drop(item);
                return Ending::StopRequested
            }

            if !self.kind.admit(&item) {
                trace!("{} session skipped an item", K::NAME);
                continue
            }

            match self.kind.forward(ticket.conn(), &item) {
                Ok(()) => (),
                Err(ConnError::Closing) => {
                    // The peer sent a close, the reactor is about to request the stop
                    self.status.set(SessionState::Draining);
                    drop(item);
                    debug!("{} session peer is closing, waiting for the stop", K::NAME);
                    ticket.wait_for_stop();
                    return Ending::StopRequested
                },
                Err(e) => {
                    self.status.set(SessionState::Draining);
                    drop(item);
                    return Ending::SendFailed(e)
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::Mutex, time::Instant};
    use comms_if::net::ConnId;

    /// Forwards `u32`s, records arm/disarm calls.
    struct Counting {
        armed: Arc<AtomicU8>
    }

    impl SessionKind for Counting {
        type Item = u32;
        const NAME: &'static str = "counting";

        fn arm(&mut self) {
            self.armed.store(1, Ordering::SeqCst);
        }

        fn disarm(&mut self) {
            self.armed.store(0, Ordering::SeqCst);
        }

        fn admit(&self, item: &u32) -> bool {
            *item != 0
        }

        fn forward(&self, conn: &dyn Connection, item: &u32) -> Result<(), ConnError> {
            conn.send_text(&item.to_string())
        }
    }

    /// Records the session state at the moment it is released.
    struct Tracked {
        status: SessionStatus,
        released_in: Arc<Mutex<Vec<SessionState>>>
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.released_in.lock().unwrap().push(self.status.state());
        }
    }

    struct Releasing;

    impl SessionKind for Releasing {
        type Item = Tracked;
        const NAME: &'static str = "releasing";

        fn arm(&mut self) {}

        fn disarm(&mut self) {}

        fn forward(&self, conn: &dyn Connection, _item: &Tracked) -> Result<(), ConnError> {
            conn.send_text("item")
        }
    }

    struct Recorder {
        id: u64,
        sent: Mutex<Vec<String>>,
        fail: Option<fn() -> ConnError>
    }

    impl Connection for Recorder {
        fn id(&self) -> ConnId {
            ConnId(self.id)
        }

        fn send_binary(&self, _data: &[u8]) -> Result<(), ConnError> {
            Err(ConnError::Closed)
        }

        fn send_text(&self, text: &str) -> Result<(), ConnError> {
            if let Some(err) = self.fail {
                return Err(err())
            }
            self.sent.lock().unwrap().push(text.into());
            Ok(())
        }
    }

    fn recorder(id: u64, fail: Option<fn() -> ConnError>) -> Arc<Recorder> {
        Arc::new(Recorder { id, sent: Mutex::new(Vec::new()), fail })
    }

    fn wait_until<F: Fn() -> bool>(f: F) {
        let start = Instant::now();
        while !f() {
            assert!(start.elapsed() < Duration::from_secs(2), "condition never met");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_forward_and_stop() {
        let armed = Arc::new(AtomicU8::new(0));
        let (tx, rx) = channel::bounded("items", 2).unwrap();
        let (handoff, status, _h) = spawn(
            Counting { armed: armed.clone() }, rx, Duration::from_millis(5)
        ).unwrap();

        let conn = recorder(1, None);
        let (ticket, requester, waiter) = ticket(conn.clone());
        let worker = thread::spawn(move || handoff.attach(ticket, waiter).unwrap());

        wait_until(|| status.state() == SessionState::Active);
        assert_eq!(armed.load(Ordering::SeqCst), 1);

        // Zero is not admitted
        for i in &[1, 0, 2, 3] {
            tx.push(*i).unwrap();
        }
        wait_until(|| conn.sent.lock().unwrap().len() == 3);

        assert_eq!(requester.stop(), StopOutcome::Acknowledged);
        assert_eq!(status.state(), SessionState::Idle);
        assert_eq!(armed.load(Ordering::SeqCst), 0);
        assert_eq!(status.served(), 1);
        assert_eq!(*conn.sent.lock().unwrap(), vec!["1", "2", "3"]);

        worker.join().unwrap();
    }

    #[test]
    fn test_send_failure_ends_session() {
        let armed = Arc::new(AtomicU8::new(0));
        let (tx, rx) = channel::bounded("items", 2).unwrap();
        let (handoff, status, _h) = spawn(
            Counting { armed: armed.clone() }, rx, Duration::from_millis(5)
        ).unwrap();

        let (ticket, requester, waiter) = ticket(recorder(2, Some(|| ConnError::Closed)));
        let worker = thread::spawn(move || handoff.attach(ticket, waiter).unwrap());

        wait_until(|| status.state() == SessionState::Active);
        tx.push(7).unwrap();

        // The worker is released once the session tore itself down
        worker.join().unwrap();
        assert_eq!(status.state(), SessionState::Idle);
        assert_eq!(armed.load(Ordering::SeqCst), 0);
        assert_eq!(requester.stop(), StopOutcome::AlreadyFinished);
    }

    #[test]
    fn test_item_released_while_draining() {
        let (tx, rx) = channel::bounded("items", 2).unwrap();
        let (handoff, status, _h) = spawn(Releasing, rx, Duration::from_millis(5)).unwrap();

        let (ticket, _requester, waiter) = ticket(recorder(3, Some(|| ConnError::Closed)));
        let worker = thread::spawn(move || handoff.attach(ticket, waiter).unwrap());
        wait_until(|| status.state() == SessionState::Active);

        let released_in = Arc::new(Mutex::new(Vec::new()));
        tx.push(Tracked { status: status.clone(), released_in: released_in.clone() }).unwrap();

        worker.join().unwrap();
        assert_eq!(*released_in.lock().unwrap(), vec![SessionState::Draining]);
        assert_eq!(status.state(), SessionState::Idle);
    }

    #[test]
    fn test_peer_close_waits_for_the_stop() {
        let armed = Arc::new(AtomicU8::new(0));
        let (tx, rx) = channel::bounded("items", 2).unwrap();
        let (handoff, status, _h) = spawn(
            Counting { armed: armed.clone() }, rx, Duration::from_millis(5)
        ).unwrap();

        let (ticket, requester, waiter) = ticket(recorder(4, Some(|| ConnError::Closing)));
        let worker = thread::spawn(move || handoff.attach(ticket, waiter).unwrap());

        wait_until(|| status.state() == SessionState::Active);
        tx.push(5).unwrap();

        // The session holds on until the stop arrives, then acknowledges it
        wait_until(|| status.state() == SessionState::Draining);
        assert_eq!(armed.load(Ordering::SeqCst), 1);

        assert_eq!(requester.stop(), StopOutcome::Acknowledged);
        assert_eq!(status.state(), SessionState::Idle);
        assert_eq!(armed.load(Ordering::SeqCst), 0);
        worker.join().unwrap();
    }
}
