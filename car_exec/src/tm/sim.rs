//! Simulated telemetry source
//!
//! Speed follows the drive duty cycle of the simulated actuators, as if every wheel turned at a
//! rate proportional to its duty cycle. The other sensors report plausible static values.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::time::Instant;
use chrono::Utc;

use super::{PulseOdometer, SensorSet, TelemetryError, TelemetryRecord, TelemetrySource};
use crate::actuator::sim::SimRig;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Encoder pulse rate at full duty.
const PULSES_PER_SECOND_AT_FULL_DUTY: f64 = 200.0;

const BASE_RSSI_DBM: i32 = -58;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct SimTelemetry {
    rig: SimRig,
    sensors: SensorSet,
    odometer: PulseOdometer,
    last_pulse_at: Instant,
    num_reads: u32
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SimTelemetry {
    pub fn new(rig: SimRig, sensors: SensorSet, odometer: PulseOdometer) -> Self {
        Self {
            rig,
            sensors,
            odometer,
            last_pulse_at: Instant::now(),
            num_reads: 0
        }
    }

    /// Pulses the encoder would have counted since the last read.
    fn count_pulses(&mut self) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_pulse_at).as_secs_f64();
        self.last_pulse_at = now;

        (self.rig.mean_drive().abs() * PULSES_PER_SECOND_AT_FULL_DUTY * elapsed).round() as u64
    }
}

impl TelemetrySource for SimTelemetry {
    fn reset(&mut self) {
        self.last_pulse_at = Instant::now();
        self.odometer.reset();
    }

    fn read(&mut self) -> Result<TelemetryRecord, TelemetryError> {
        let mut rec = TelemetryRecord::new(Utc::now());
        self.num_reads = self.num_reads.wrapping_add(1);

        if self.sensors.rssi {
            // A few dB of wobble
            rec.rssi = Some(BASE_RSSI_DBM - (self.num_reads % 4) as i32);
        }
        if self.sensors.speed {
            let pulses = self.count_pulses();
            rec.speed = Some(self.odometer.speed_kmh(pulses));
        }
        if self.sensors.accelerometer {
            rec.accelerometer = Some([0.0, 0.0, 9.81]);
        }
        if self.sensors.magnetometer {
            rec.magnetometer = Some([22.0, 4.5, -41.0]);
        }
        if self.sensors.gyroscope {
            // Yaw rate from the difference between the two sides while pivoting
            let state = self.rig.snapshot();
            let left = (state.motors[0] as f32 + state.motors[2] as f32) / 2.0;
            let right = (state.motors[1] as f32 + state.motors[3] as f32) / 2.0;
            rec.gyroscope = Some([0.0, 0.0, (right - left) / 100.0]);
        }

        Ok(rec)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sensor_selection() {
        let mut tm = SimTelemetry::new(SimRig::new(), SensorSet::minimal(), PulseOdometer::new(20, 0.066));
        let rec = tm.read().unwrap();
        assert_eq!(rec.rssi, None);
        assert_eq!(rec.speed, None);

        let mut tm = SimTelemetry::new(SimRig::new(), SensorSet::all(), PulseOdometer::new(20, 0.066));
        tm.reset();
        let rec = tm.read().unwrap();
        assert!(rec.rssi.is_some());
        // Not driving
        assert_eq!(rec.speed, Some(0.0));
        assert_eq!(rec.gyroscope, Some([0.0, 0.0, 0.0]));
    }
}
