//! # Telemetry Sampler
//!
//! The sampler task reads the telemetry source at a fixed period and pushes the records into the
//! telemetry channel, but only between a start and a stop signal:
//!
//! ```text
//! Stopped --start--> Sampling --stop--> Stopped
//! ```
//!
//! While stopped the task blocks on the start signal and never touches the source. Starting
//! resets the source's integrating counters. While sampling the stop signal is checked before
//! every read, while waiting for room in the channel and during the inter-sample sleep, so no
//! record is pushed after the stop has been observed.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    io,
    sync::{Arc, atomic::{AtomicU8, Ordering}},
    thread::{self, JoinHandle},
    time::{Duration, Instant}
};
use log::{debug, info, trace, warn};

use super::{TelemetryRecord, TelemetrySource};
use crate::{
    channel::{ChanTx, ChannelError, PushError},
    signal::Signal
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Maximum number of pending start (or stop) signals.
const MAX_PENDING_SIGNALS: usize = 16;

/// Interval at which the stop signal is checked while the channel is full.
const FULL_CHANNEL_POLL: Duration = Duration::from_millis(20);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Handle used to start and stop the sampler. Clones control the same sampler.
#[derive(Clone)]
pub struct SamplerCtrl {
    start: Signal,
    stop: Signal,
    state: Arc<AtomicU8>
}

pub struct TelemetrySampler<S> {
    source: S,
    ctrl: SamplerCtrl,
    tm_tx: ChanTx<TelemetryRecord>,
    period: Duration
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Stopped,
    Sampling
}

enum PushOutcome {
    Pushed,
    Stale,
    Stopped
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SamplerCtrl {
    pub fn new() -> Self {
        Self {
            start: Signal::counting("tm_start", MAX_PENDING_SIGNALS),
            stop: Signal::counting("tm_stop", MAX_PENDING_SIGNALS),
            state: Arc::new(AtomicU8::new(SamplerState::Stopped as u8))
        }
    }

    /// Ask the sampler to start sampling.
    pub fn start(&self) {
        if !self.start.give() {
            warn!("Telemetry sampler start signal saturated");
        }
    }

    /// Ask the sampler to stop sampling.
    pub fn stop(&self) {
        if !self.stop.give() {
            warn!("Telemetry sampler stop signal saturated");
        }
    }

    pub fn state(&self) -> SamplerState {
        match self.state.load(Ordering::SeqCst) {
            s if s == SamplerState::Sampling as u8 => SamplerState::Sampling,
            _ => SamplerState::Stopped
        }
    }

    fn set_state(&self, state: SamplerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl Default for SamplerCtrl {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: TelemetrySource> TelemetrySampler<S> {
    pub fn new(
        source: S,
        ctrl: SamplerCtrl,
        tm_tx: ChanTx<TelemetryRecord>,
        period: Duration
    ) -> Self {
        Self { source, ctrl, tm_tx, period }
    }

    /// Run the sampler. Only returns if the telemetry channel disconnects.
    pub fn run(mut self) -> Result<(), ChannelError> {
        info!("Telemetry sampler started, period {:?}", self.period);

        loop {
            debug!("Waiting for the start signal");
            self.ctrl.start.take();

            self.source.reset();
            self.ctrl.set_state(SamplerState::Sampling);
            info!("Telemetry sampling started");

            self.sample_until_stopped()?;

            self.ctrl.set_state(SamplerState::Stopped);
            info!("Telemetry sampling stopped");
        }
    }

    fn sample_until_stopped(&mut self) -> Result<(), ChannelError> {
        loop {
            if self.ctrl.stop.try_take() {
                return Ok(())
            }

            match self.source.read() {
                Ok(rec) => match self.push(rec)? {
                    PushOutcome::Pushed => (),
                    PushOutcome::Stale => debug!("Telemetry channel full for a whole period, record dropped"),
                    PushOutcome::Stopped => return Ok(())
                },
                Err(e) => warn!("Telemetry read failed, sample skipped: {}", e)
            }

            // Sleep until the next sample, waking early on a stop
            if self.ctrl.stop.take_timeout(self.period) {
                return Ok(())
            }
        }
    }

    /// Push a record, waiting at most one period for room and giving up early on a stop.
    fn push(&mut self, mut rec: TelemetryRecord) -> Result<PushOutcome, ChannelError> {
        let deadline = Instant::now() + self.period;

        loop {
            let wait = deadline.saturating_duration_since(Instant::now()).min(FULL_CHANNEL_POLL);

            match self.tm_tx.push_timeout(rec, wait) {
                Ok(()) => {
                    trace!("Telemetry record pushed");
                    return Ok(PushOutcome::Pushed)
                },
                Err(PushError::Disconnected(_)) => {
                    return Err(ChannelError::Disconnected(self.tm_tx.name()))
                },
                Err(e) => rec = e.into_inner()
            }

            if self.ctrl.stop.try_take() {
                return Ok(PushOutcome::Stopped)
            }
            if Instant::now() >= deadline {
                return Ok(PushOutcome::Stale)
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Spawn the telemetry sampler task.
pub fn spawn<S>(
    source: S,
    ctrl: SamplerCtrl,
    tm_tx: ChanTx<TelemetryRecord>,
    period: Duration
) -> io::Result<JoinHandle<()>>
where
    S: TelemetrySource + 'static
{
    thread::Builder::new()
        .name("tm_sampler".into())
        .spawn(move || {
            if let Err(e) = TelemetrySampler::new(source, ctrl, tm_tx, period).run() {
                warn!("Telemetry sampler stopped: {}", e);
            }
        })
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
