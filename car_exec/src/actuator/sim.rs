//! Simulated actuators
//!
//! Outputs are held in a [`SimRig`] which other parts of the simulation (the simulated telemetry
//! source, tests) can read back.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::sync::{Arc, atomic::{AtomicI8, Ordering}};
use log::debug;

use super::{check_angle, ActuatorDriver, ActuatorError, MotorDemand, MotorId, ServoAxis};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Shared state of the simulated actuators. Clones share the same state.
#[derive(Clone, Default)]
pub struct SimRig {
    inner: Arc<RigInner>
}

/// A snapshot of the rig's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RigState {
    /// Signed duty cycle of each motor in percent, indexed by [`MotorId::index`]
    pub motors: [i8; 4],

    pub pan_deg: i8,

    pub tilt_deg: i8
}

pub struct SimActuator {
    rig: SimRig
}

#[derive(Default)]
struct RigInner {
    motors: [AtomicI8; 4],
    pan_deg: AtomicI8,
    tilt_deg: AtomicI8
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SimRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RigState {
        let mut motors = [0i8; 4];
        for (m, a) in motors.iter_mut().zip(self.inner.motors.iter()) {
            *m = a.load(Ordering::Relaxed);
        }

        RigState {
            motors,
            pan_deg: self.inner.pan_deg.load(Ordering::Relaxed),
            tilt_deg: self.inner.tilt_deg.load(Ordering::Relaxed)
        }
    }

    /// Mean signed drive duty cycle over all wheels as a fraction, -1.0 to 1.0.
    pub fn mean_drive(&self) -> f64 {
        let state = self.snapshot();
        state.motors.iter().map(|&m| m as f64).sum::<f64>() / (4.0 * 100.0)
    }
}

impl SimActuator {
    pub fn new(rig: SimRig) -> Self {
        Self { rig }
    }
}

impl ActuatorDriver for SimActuator {
    fn set_motor(&mut self, motor: MotorId, demand: MotorDemand) -> Result<(), ActuatorError> {
        debug!("Sim motor {:?}: {:?}", motor, demand);
        self.rig.inner.motors[motor.index()].store(demand.signed_pct(), Ordering::Relaxed);
        Ok(())
    }

    fn set_servo(&mut self, axis: ServoAxis, angle_deg: i8) -> Result<(), ActuatorError> {
        check_angle(angle_deg)?;

        debug!("Sim servo {}: {} deg", axis, angle_deg);
        match axis {
            ServoAxis::Pan => self.rig.inner.pan_deg.store(angle_deg, Ordering::Relaxed),
            ServoAxis::Tilt => self.rig.inner.tilt_deg.store(angle_deg, Ordering::Relaxed)
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
