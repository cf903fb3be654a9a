//! # Actuator Driver
//!
//! Unified interface over the car's actuators: four drive motors, one per wheel, and the two
//! servos of the camera mount. Implementations apply demands synchronously and without blocking
//! for long. Only the command dispatcher holds a driver.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// [`ActuatorDriver`] implementation for the PCA9685 16 channel PWM driver board.
pub mod pca9685;

/// Simulated actuators.
pub mod sim;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Serialize, Deserialize};

pub use comms_if::tc::ServoAxis;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Trait to provide a unified API for the car's actuators.
pub trait ActuatorDriver: Send {
    /// Apply a demand to a single drive motor.
    fn set_motor(&mut self, motor: MotorId, demand: MotorDemand) -> Result<(), ActuatorError>;

    /// Point a camera servo at the given angle in degrees, -90 to 90.
    fn set_servo(&mut self, axis: ServoAxis, angle_deg: i8) -> Result<(), ActuatorError>;
}

impl<T: ActuatorDriver + ?Sized> ActuatorDriver for Box<T> {
    fn set_motor(&mut self, motor: MotorId, demand: MotorDemand) -> Result<(), ActuatorError> {
        (**self).set_motor(motor, demand)
    }

    fn set_servo(&mut self, axis: ServoAxis, angle_deg: i8) -> Result<(), ActuatorError> {
        (**self).set_servo(axis, angle_deg)
    }
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A duty cycle in percent, 0 to 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DutyCycle(u8);

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// The drive motors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotorId {
    FrontLeft,
    FrontRight,
    RearLeft,
    RearRight
}

/// Demand for a single drive motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorDemand {
    Advance(DutyCycle),
    Retreat(DutyCycle),
    Brake
}

#[derive(thiserror::Error, Debug)]
pub enum ActuatorError {
    #[error("An I2C error occured")]
    I2c,

    #[error("Invalid data sent to the PWM driver")]
    InvalidInputData,

    #[error("Servo angle {0} is outside -90 to 90 degrees")]
    InvalidAngle(i8),

    #[error("Invalid PWM channel {0}")]
    InvalidChannel(u8),

    #[error("Could not open the actuator driver: {0}")]
    Init(String)
}

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Maximum absolute servo angle.
pub const SERVO_MAX_ANGLE_DEG: i8 = 90;

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl DutyCycle {
    pub const ZERO: DutyCycle = DutyCycle(0);
    pub const FULL: DutyCycle = DutyCycle(100);

    /// Create a duty cycle, clamping to 100 %.
    pub fn clamped(pct: u8) -> Self {
        DutyCycle(pct.min(100))
    }

    pub fn pct(&self) -> u8 {
        self.0
    }

    /// The duty cycle as a fraction between 0.0 and 1.0.
    pub fn fraction(&self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl MotorId {
    pub const ALL: [MotorId; 4] = [
        MotorId::FrontLeft,
        MotorId::FrontRight,
        MotorId::RearLeft,
        MotorId::RearRight
    ];

    pub const LEFT: [MotorId; 2] = [MotorId::FrontLeft, MotorId::RearLeft];

    pub const RIGHT: [MotorId; 2] = [MotorId::FrontRight, MotorId::RearRight];

    /// Position of this motor in [`MotorId::ALL`].
    pub fn index(&self) -> usize {
        match self {
            MotorId::FrontLeft => 0,
            MotorId::FrontRight => 1,
            MotorId::RearLeft => 2,
            MotorId::RearRight => 3
        }
    }
}

impl MotorDemand {
    /// Signed duty cycle in percent, positive forwards.
    pub fn signed_pct(&self) -> i8 {
        match self {
            MotorDemand::Advance(d) => d.pct() as i8,
            MotorDemand::Retreat(d) => -(d.pct() as i8),
            MotorDemand::Brake => 0
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Check a servo angle is within the mount's travel.
pub fn check_angle(angle_deg: i8) -> Result<(), ActuatorError> {
    if angle_deg < -SERVO_MAX_ANGLE_DEG || angle_deg > SERVO_MAX_ANGLE_DEG {
        Err(ActuatorError::InvalidAngle(angle_deg))
    }
    else {
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
