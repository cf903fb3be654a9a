//! Telemetry session
//!
//! Starts the telemetry sampler when a client attaches and stops it when the session ends.
//! Records sampled before the session started, left over in the channel from a previous session,
//! are dropped rather than sent.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use comms_if::net::{ConnError, Connection};
use log::warn;

use super::SessionKind;
use crate::tm::{TelemetryRecord, sampler::SamplerCtrl};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct TelemetrySession {
    ctrl: SamplerCtrl,
    started_at: Option<DateTime<Utc>>
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TelemetrySession {
    pub fn new(ctrl: SamplerCtrl) -> Self {
        Self {
            ctrl,
            started_at: None
        }
    }
}

impl SessionKind for TelemetrySession {
    type Item = TelemetryRecord;
    const NAME: &'static str = "telemetry";

    fn arm(&mut self) {
        self.started_at = Some(Utc::now());
        self.ctrl.start();
    }

    fn disarm(&mut self) {
        self.ctrl.stop();
        self.started_at = None;
    }

    fn admit(&self, rec: &TelemetryRecord) -> bool {
        match self.started_at {
            Some(t) => rec.timestamp >= t,
            None => false
        }
    }

    fn forward(&self, conn: &dyn Connection, rec: &TelemetryRecord) -> Result<(), ConnError> {
        match rec.to_json() {
            Ok(json) => conn.send_text(&json),
            Err(e) => {
                // Nothing the peer did wrong, skip the record and keep the session
                warn!("Could not serialise telemetry record: {}", e);
                Ok(())
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
    use chrono::Duration;

    #[test]
    fn test_stale_records_dropped() {
        let mut session = TelemetrySession::new(SamplerCtrl::new());
        let before = TelemetryRecord::new(Utc::now() - Duration::seconds(1));

        // Nothing is admitted outside a session
        assert!(!session.admit(&before));

        session.arm();
        assert!(!session.admit(&before));
        assert!(session.admit(&TelemetryRecord::new(Utc::now())));

        session.disarm();
        assert!(!session.admit(&TelemetryRecord::new(Utc::now())));
    }
}
