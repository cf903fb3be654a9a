//! Video streaming session
//!
//! Forwards every frame popped from the frame channel as one binary message. The frame pipeline
//! runs whether or not a client is attached, so arming is a no-op and frames captured while idle
//! simply wait in the channel.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::net::{ConnError, Connection};
use log::trace;

use super::SessionKind;
use crate::frame::Frame;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct StreamSession;

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SessionKind for StreamSession {
    type Item = Frame;
    const NAME: &'static str = "stream";

    fn arm(&mut self) {}

    fn disarm(&mut self) {}

    fn forward(&self, conn: &dyn Connection, frame: &Frame) -> Result<(), ConnError> {
        trace!("Sending frame {} ({} B) to {}", frame.seq(), frame.len(), conn.id());
        conn.send_binary(frame.data())
    }
}
