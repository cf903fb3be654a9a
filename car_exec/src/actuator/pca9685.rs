//! [`ActuatorDriver`] implementation for the PCA9685 driver
//!
//! The board runs at 50 Hz for the servos. Each drive motor is wired to an H-bridge through an
//! IN1/IN2 channel pair: PWM on IN1 drives forwards, PWM on IN2 backwards, both off coasts the
//! motor to a stop.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use pwm_pca9685::{Channel, Pca9685};
use embedded_hal::blocking::i2c::{Write, WriteRead};
use log::debug;
use serde::{Serialize, Deserialize};
use util::maths::{clamp, lin_map};

use super::{check_angle, ActuatorDriver, ActuatorError, MotorDemand, MotorId, ServoAxis};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

const MAX_PWM: u16 = 4095;

/// Prescale value giving a 50 Hz output from the 25 MHz internal oscillator.
const PRESCALE_50HZ: u8 = 121;

/// PWM period at 50 Hz in microseconds.
const PERIOD_US: f64 = 20_000.0;

/// Servo pulse width range in microseconds, for -90 to 90 degrees.
const SERVO_PULSE_US: (f64, f64) = (500.0, 2400.0);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Assignment of board channels to actuators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMap {
    /// (IN1, IN2) channels of each motor, indexed by [`MotorId::index`]
    pub motors: [(u8, u8); 4],

    pub pan: u8,

    pub tilt: u8
}

pub struct Pca9685Actuator<I2C> {
    pwm: Pca9685<I2C>,
    map: ChannelMap
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            motors: [(0, 1), (2, 3), (4, 5), (6, 7)],
            pan: 8,
            tilt: 9
        }
    }
}

impl<I2C, E> Pca9685Actuator<I2C>
where
    I2C: Write<Error = E> + WriteRead<Error = E>
{
    /// Initialise the board on the given bus and stop all motors.
    pub fn new(i2c: I2C, address: u8, map: ChannelMap) -> Result<Self, ActuatorError> {
        // Check the map before touching the hardware
        for &(in1, in2) in map.motors.iter() {
            to_channel(in1)?;
            to_channel(in2)?;
        }
        to_channel(map.pan)?;
        to_channel(map.tilt)?;

        let mut pwm = Pca9685::new(i2c, address).map_err(map_pwm_err)?;
        pwm.set_prescale(PRESCALE_50HZ).map_err(map_pwm_err)?;
        pwm.enable().map_err(map_pwm_err)?;

        let mut act = Self { pwm, map };

        for m in MotorId::ALL.iter() {
            act.drive(*m, MotorDemand::Brake)?;
        }

        Ok(act)
    }

    fn drive(&mut self, motor: MotorId, demand: MotorDemand) -> Result<(), ActuatorError> {
        let (in1, in2) = self.map.motors[motor.index()];

        let (in1_counts, in2_counts) = match demand {
            MotorDemand::Advance(d) => (duty_to_counts(d.fraction()), 0),
            MotorDemand::Retreat(d) => (0, duty_to_counts(d.fraction())),
            MotorDemand::Brake => (0, 0)
        };

        debug!("Motor {:?}: IN1 = {}, IN2 = {}", motor, in1_counts, in2_counts);

        // Turn off the opposing input first so both are never driven at once
        if in1_counts == 0 {
            self.set_duty(in1, 0)?;
            self.set_duty(in2, in2_counts)
        }
        else {
            self.set_duty(in2, 0)?;
            self.set_duty(in1, in1_counts)
        }
    }

    fn set_duty(&mut self, channel: u8, counts: u16) -> Result<(), ActuatorError> {
        let channel = to_channel(channel)?;

        match counts {
            0 => self.pwm.set_channel_full_off(channel),
            c => self.pwm.set_channel_on_off(channel, 0, c.min(MAX_PWM))
        }.map_err(map_pwm_err)
    }
}

impl<I2C, E> ActuatorDriver for Pca9685Actuator<I2C>
where
    I2C: Write<Error = E> + WriteRead<Error = E> + Send
{
    fn set_motor(&mut self, motor: MotorId, demand: MotorDemand) -> Result<(), ActuatorError> {
        self.drive(motor, demand)
    }

    fn set_servo(&mut self, axis: ServoAxis, angle_deg: i8) -> Result<(), ActuatorError> {
        check_angle(angle_deg)?;

        let channel = match axis {
            ServoAxis::Pan => self.map.pan,
            ServoAxis::Tilt => self.map.tilt
        };

        let counts = servo_counts(angle_deg);
        debug!("Servo {}: {} deg, {} counts", axis, angle_deg, counts);

        self.set_duty(channel, counts)
    }
}

#[cfg(all(target_arch = "arm", target_os = "linux"))]
impl Pca9685Actuator<rppal::i2c::I2c> {
    /// Open the board on one of the Raspberry Pi's I2C buses.
    pub fn open_rpi(bus: u8, address: u8, map: ChannelMap) -> Result<Self, ActuatorError> {
        let i2c = rppal::i2c::I2c::with_bus(bus)
            .map_err(|e| ActuatorError::Init(e.to_string()))?;

        Self::new(i2c, address, map)
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn duty_to_counts(fraction: f64) -> u16 {
    (clamp(fraction, 0.0, 1.0) * MAX_PWM as f64).round() as u16
}

/// Number of counts of the 50 Hz period the servo pulse for this angle lasts.
fn servo_counts(angle_deg: i8) -> u16 {
    let pulse_us = lin_map((-90.0, 90.0), SERVO_PULSE_US, angle_deg as f64);
    (pulse_us / PERIOD_US * (MAX_PWM as f64 + 1.0)).round() as u16
}

fn to_channel(channel: u8) -> Result<Channel, ActuatorError> {
    Ok(match channel {
        0 => Channel::C0,
        1 => Channel::C1,
        2 => Channel::C2,
        3 => Channel::C3,
        4 => Channel::C4,
        5 => Channel::C5,
        6 => Channel::C6,
        7 => Channel::C7,
        8 => Channel::C8,
        9 => Channel::C9,
        10 => Channel::C10,
        11 => Channel::C11,
        12 => Channel::C12,
        13 => Channel::C13,
        14 => Channel::C14,
        15 => Channel::C15,
        c => return Err(ActuatorError::InvalidChannel(c))
    })
}

fn map_pwm_err<E>(e: pwm_pca9685::Error<E>) -> ActuatorError {
    match e {
        pwm_pca9685::Error::I2C(_) => ActuatorError::I2c,
        pwm_pca9685::Error::InvalidInputData => ActuatorError::InvalidInputData
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_servo_counts() {
        // 500 us, 1450 us, 2400 us of a 20 ms period
        assert_eq!(servo_counts(-90), 102);
        assert_eq!(servo_counts(0), 297);
        assert_eq!(servo_counts(90), 492);
    }

    #[test]
    fn test_duty_counts() {
        assert_eq!(duty_to_counts(0.0), 0);
        assert_eq!(duty_to_counts(0.5), 2048);
        assert_eq!(duty_to_counts(1.0), 4095);
    }

    #[test]
    fn test_channels() {
        assert!(to_channel(15).is_ok());
        assert!(matches!(to_channel(16), Err(ActuatorError::InvalidChannel(16))));
    }
}
