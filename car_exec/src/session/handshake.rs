//! # Session tickets and the stop handshake
//!
//! Every streaming or telemetry connection is represented by a ticket, which travels from the
//! server's reactor, through a pool worker and the handoff slot, to the session task. The
//! reactor keeps the matching [`StopRequester`].
//!
//! Stopping is two-phase: the requester signals stop and then blocks until the session task
//! acknowledges that it has released the item it held and disarmed its producer. Only then may
//! the reactor complete the close with the peer.
//!
//! A ticket moves through the phases
//!
//! ```text
//! Queued --attach--> Attached --finish/drop--> Finished
//!    \
//!     --stop--> Cancelled
//! ```
//!
//! A ticket stopped while still queued is cancelled without waiting, there is nothing in flight
//! to release. Cancelling also wakes the pool worker waiting on the ticket, so the worker goes
//! back to idle straight away instead of waiting for the session ahead of it to end. A ticket
//! which finished on its own (send failure) releases a waiting requester immediately by dropping
//! its acknowledgement sender.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::sync::{Arc, atomic::{AtomicU8, Ordering}};
use comms_if::net::{ConnId, Connection};
use crossbeam_channel::{self as cbc, Receiver, Sender, TryRecvError};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The session side of a connection.
pub struct SessionTicket {
    conn: Arc<dyn Connection>,
    phase: Arc<AtomicU8>,
    stop_rx: Receiver<()>,
    ack_tx: Sender<()>,
    _done_tx: Sender<()>
}

/// The reactor side of a connection, used to stop its session.
pub struct StopRequester {
    conn_id: ConnId,
    phase: Arc<AtomicU8>,
    stop_tx: Sender<()>,
    ack_rx: Receiver<()>,
    cancel_tx: Sender<()>
}

/// Waits for a ticket to be finished, dropped or cancelled.
pub struct TicketWaiter {
    done_rx: Receiver<()>,
    cancel_rx: Receiver<()>
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketPhase {
    Queued,
    Attached,
    Cancelled,
    Finished
}

/// How a stop request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The ticket was still queued and is now cancelled
    Cancelled,

    /// The session tore down and acknowledged the stop
    Acknowledged,

    /// The session had already ended by itself
    AlreadyFinished
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Create the ticket for a newly accepted session connection.
pub fn ticket(conn: Arc<dyn Connection>) -> (SessionTicket, StopRequester, TicketWaiter) {
    let phase = Arc::new(AtomicU8::new(TicketPhase::Queued as u8));
    let (stop_tx, stop_rx) = cbc::bounded(1);
    let (ack_tx, ack_rx) = cbc::bounded(1);
    let (done_tx, done_rx) = cbc::bounded(1);
    let (cancel_tx, cancel_rx) = cbc::bounded(1);

    let conn_id = conn.id();

    (
        SessionTicket {
            conn,
            phase: phase.clone(),
            stop_rx,
            ack_tx,
            _done_tx: done_tx
        },
        StopRequester {
            conn_id,
            phase,
            stop_tx,
            ack_rx,
            cancel_tx
        },
        TicketWaiter { done_rx, cancel_rx }
    )
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TicketPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TicketPhase::Queued,
            1 => TicketPhase::Attached,
            2 => TicketPhase::Cancelled,
            _ => TicketPhase::Finished
        }
    }
}

impl SessionTicket {
    /// Mark the ticket as attached to the session task. Returns `false` if the ticket was
    /// cancelled while queued, in which case it must be dropped without serving it.
    pub fn attach(&self) -> bool {
        self.phase.compare_exchange(
            TicketPhase::Queued as u8,
            TicketPhase::Attached as u8,
            Ordering::SeqCst,
            Ordering::SeqCst
        ).is_ok()
    }

    pub fn conn(&self) -> &dyn Connection {
        &*self.conn
    }

    /// Non-blocking check for a stop request. A requester that went away counts as a stop.
    pub fn stop_requested(&self) -> bool {
        match self.stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => true,
            Err(TryRecvError::Empty) => false
        }
    }

    /// Block until a stop is requested, or the requester goes away.
    pub fn wait_for_stop(&self) {
        self.stop_rx.recv().ok();
    }

    /// Finish the session. If `acknowledge` is set the waiting requester is told the stop is
    /// complete, otherwise it sees the session as having ended by itself.
    pub fn finish(self, acknowledge: bool) {
        self.phase.store(TicketPhase::Finished as u8, Ordering::SeqCst);

        if acknowledge {
            // Capacity 1 and sent at most once, so never full
            self.ack_tx.try_send(()).ok();
        }
    }

    pub fn phase(&self) -> TicketPhase {
        TicketPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        // Keep a cancelled ticket cancelled, anything else is finished once dropped
        let _ = self.phase.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
            match TicketPhase::from_u8(p) {
                TicketPhase::Cancelled => None,
                _ => Some(TicketPhase::Finished as u8)
            }
        });
    }
}

impl StopRequester {
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn phase(&self) -> TicketPhase {
        TicketPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Stop the session, blocking until it has torn down.
    pub fn stop(self) -> StopOutcome {
        let cancelled = self.phase.compare_exchange(
            TicketPhase::Queued as u8,
            TicketPhase::Cancelled as u8,
            Ordering::SeqCst,
            Ordering::SeqCst
        ).is_ok();

        if cancelled {
            // Capacity 1 and sent at most once, so never full
            self.cancel_tx.try_send(()).ok();
            return StopOutcome::Cancelled
        }

        // Capacity 1 and sent at most once, so never full
        self.stop_tx.try_send(()).ok();

        // The ticket drops its ack sender when it finishes, so this can't block forever
        match self.ack_rx.recv() {
            Ok(()) => StopOutcome::Acknowledged,
            Err(_) => StopOutcome::AlreadyFinished
        }
    }
}

impl TicketWaiter {
    /// Block until the ticket has been finished, dropped or cancelled.
    pub fn wait(self) {
        // Nothing is ever sent on `done_rx`, its receive returns once the ticket is dropped
        cbc::select! {
            recv(self.done_rx) -> _ => (),
            recv(self.cancel_rx) -> msg => {
                // Requester dropped without stopping, the ticket is still live
                if msg.is_err() {
                    self.done_rx.recv().ok();
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
