//! # Telemetry
//!
//! Telemetry sources read the car's instantaneous sensor values into a [`TelemetryRecord`]. The
//! [`sampler`] task drives the configured source while a telemetry session is active.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Gated telemetry sampling task.
pub mod sampler;

/// Simulated telemetry source.
pub mod sim;

/// Telemetry source reading host information.
pub mod host;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{f64::consts::PI, time::{Duration, Instant}};
use serde::{Serialize, Deserialize};

pub use comms_if::tm::TelemetryRecord;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// A source of telemetry records.
pub trait TelemetrySource: Send {
    /// Zero any integrating counters, called when sampling starts.
    fn reset(&mut self);

    /// Read one record, timestamped now.
    fn read(&mut self) -> Result<TelemetryRecord, TelemetryError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Which optional fields the records carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSet {
    pub rssi: bool,
    pub speed: bool,
    pub accelerometer: bool,
    pub magnetometer: bool,
    pub gyroscope: bool
}

/// Converts wheel encoder pulse counts into ground speed.
#[derive(Debug, Clone)]
pub struct PulseOdometer {
    encoder_slots: u32,
    wheel_diameter_m: f64,
    window_start: Instant
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("Could not read sensor: {0}")]
    Io(std::io::Error),

    #[error("Sensor not available: {0}")]
    Unavailable(String)
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for SensorSet {
    fn default() -> Self {
        Self {
            rssi: true,
            speed: true,
            accelerometer: false,
            magnetometer: false,
            gyroscope: false
        }
    }
}

impl SensorSet {
    /// Records carrying only a timestamp.
    pub fn minimal() -> Self {
        Self {
            rssi: false,
            speed: false,
            accelerometer: false,
            magnetometer: false,
            gyroscope: false
        }
    }

    pub fn all() -> Self {
        Self {
            rssi: true,
            speed: true,
            accelerometer: true,
            magnetometer: true,
            gyroscope: true
        }
    }
}

impl PulseOdometer {
    pub fn new(encoder_slots: u32, wheel_diameter_m: f64) -> Self {
        Self {
            encoder_slots: encoder_slots.max(1),
            wheel_diameter_m,
            window_start: Instant::now()
        }
    }

    /// Start a new counting window. The pulse counter must be cleared at the same time.
    pub fn reset(&mut self) {
        self.window_start = Instant::now();
    }

    /// Speed in km/h given the pulses counted since the last call (or reset), and start a new
    /// window.
    pub fn speed_kmh(&mut self, pulses: u64) -> f32 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.window_start);
        self.window_start = now;

        speed_from_pulses(pulses, elapsed, self.encoder_slots, self.wheel_diameter_m)
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Ground speed in km/h from `pulses` counted over `elapsed` by an encoder with `encoder_slots`
/// slots per revolution.
pub fn speed_from_pulses(
    pulses: u64,
    elapsed: Duration,
    encoder_slots: u32,
    wheel_diameter_m: f64
) -> f32 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || encoder_slots == 0 {
        return 0.0
    }

    let pulses_per_second = pulses as f64 / secs;
    let rpm = pulses_per_second / encoder_slots as f64 * 60.0;

    (rpm * wheel_diameter_m * PI * 60.0 / 1000.0) as f32
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_speed_from_pulses() {
        // 20 pulses/s on a 20 slot encoder is 60 RPM
        let kmh = speed_from_pulses(10, Duration::from_millis(500), 20, 0.066);
        let expected = 60.0 * 0.066 * PI * 60.0 / 1000.0;
        assert!((kmh as f64 - expected).abs() < 1e-4);

        assert_eq!(speed_from_pulses(0, Duration::from_millis(500), 20, 0.066), 0.0);
        assert_eq!(speed_from_pulses(10, Duration::from_secs(0), 20, 0.066), 0.0);
    }
}
