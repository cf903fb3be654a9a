//! # Command Ingress
//!
//! Turns control messages received on the control endpoint into commands for the dispatcher.
//! Only valid commands ever reach the command channel, anything else is logged and dropped.
//! The operator gets no reply either way.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicU64, Ordering};
use comms_if::tc::{CarCmd, TcParseError};
use log::{debug, warn};

use crate::channel::{ChanTx, ChannelError};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct CmdIngress {
    cmd_tx: ChanTx<CarCmd>,
    accepted: AtomicU64,
    rejected: AtomicU64
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum IngressError {
    #[error("Invalid control message: {0}")]
    Invalid(TcParseError),

    #[error("Expected a text control message, got {0} bytes of binary")]
    NonText(usize),

    #[error("Could not enqueue the command: {0}")]
    Channel(ChannelError)
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CmdIngress {
    pub fn new(cmd_tx: ChanTx<CarCmd>) -> Self {
        Self {
            cmd_tx,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0)
        }
    }

    /// Handle a text control message.
    ///
    /// A valid command is pushed to the command channel, blocking while the channel is full.
    pub fn handle_text(&self, text: &str) -> Result<CarCmd, IngressError> {
        let cmd = match CarCmd::from_json(text) {
            Ok(c) => c,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping control message {:?}: {}", text, e);
                return Err(IngressError::Invalid(e))
            }
        };

        self.cmd_tx.push(cmd).map_err(IngressError::Channel)?;
        self.accepted.fetch_add(1, Ordering::Relaxed);
        debug!("Enqueued {:?}", cmd);

        Ok(cmd)
    }

    /// Handle a binary message on the control endpoint, which is always a protocol violation.
    pub fn handle_binary(&self, data: &[u8]) -> IngressError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!("Dropping binary message of {} bytes on the control endpoint", data.len());

        IngressError::NonText(data.len())
    }

    /// Number of commands enqueued so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Number of messages dropped so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel;

    #[test]
    fn test_valid_then_brake() {
        let (tx, rx) = channel::bounded("cmd", 2).unwrap();
        let ingress = CmdIngress::new(tx);

        ingress.handle_text(r#"{"command": 1, "value": 50}"#).unwrap();
        ingress.handle_text(r#"{"command": 3}"#).unwrap();

        assert_eq!(rx.try_pop().unwrap(), Some(CarCmd::Advance { duty_pct: 50 }));
        assert_eq!(rx.try_pop().unwrap(), Some(CarCmd::Brake));
        assert_eq!(ingress.accepted(), 2);
    }

    #[test]
    fn test_invalid_never_enqueued() {
        let (tx, rx) = channel::bounded("cmd", 2).unwrap();
        let ingress = CmdIngress::new(tx);

        for msg in [
            r#"{"command": 9}"#,
            r#"{"command": 1}"#,
            r#"{"command": 2, "value": 250}"#,
            r#"{"command": 6, "value": "left"}"#,
            "garbage"
        ].iter() {
            assert!(matches!(ingress.handle_text(msg), Err(IngressError::Invalid(_))));
        }

        assert!(matches!(ingress.handle_binary(&[1, 2, 3]), IngressError::NonText(3)));

        assert_eq!(rx.try_pop().unwrap(), None);
        assert_eq!(ingress.accepted(), 0);
        assert_eq!(ingress.rejected(), 6);
    }
}
