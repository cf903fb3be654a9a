//! # Telecommand module
//!
//! This module provides the control messages sent by the operator to the car's control endpoint,
//! and the validated command records they are parsed into.
//!
//! On the wire a control message is a JSON object of the form
//! `{"command": <integer code>, "value": <integer or null>}`. The codes are:
//!
//! | Code | Command    | Value                    |
//! |------|------------|--------------------------|
//! | 1    | Advance    | duty cycle, 0 to 100 %   |
//! | 2    | Retreat    | duty cycle, 0 to 100 %   |
//! | 3    | Brake      | ignored                  |
//! | 4    | Turn left  | duty cycle, 0 to 100 %   |
//! | 5    | Turn right | duty cycle, 0 to 100 %   |
//! | 6    | Look (pan) | angle, -90 to 90 degrees |
//! | 7    | Look (tilt)| angle, -90 to 90 degrees |

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// Internal
use std::{fmt, str::FromStr};

// External
use serde::{Serialize, Deserialize};
use serde_json::{self, Value};
use structopt::StructOpt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Maximum drive duty cycle in percent.
pub const DUTY_MAX_PCT: i64 = 100;

/// Maximum absolute camera servo angle in degrees.
pub const SERVO_MAX_DEG: i64 = 90;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A control message as it appears on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlMsg {
    /// The integer command code
    pub command: i64,

    /// The optional integer argument
    #[serde(default)]
    pub value: Option<i64>
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// A validated car command.
///
/// Also used as the command grammar of the command line operator client, hence the `StructOpt`
/// derive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StructOpt)]
pub enum CarCmd {
    /// Drive all wheels forwards at the given duty cycle in percent
    #[structopt(name = "adv")]
    Advance {
        duty_pct: u8
    },

    /// Drive all wheels backwards at the given duty cycle in percent
    #[structopt(name = "ret")]
    Retreat {
        duty_pct: u8
    },

    /// Stop all wheels
    #[structopt(name = "brake")]
    Brake,

    /// Spin left on the spot at the given duty cycle in percent
    #[structopt(name = "left")]
    TurnLeft {
        duty_pct: u8
    },

    /// Spin right on the spot at the given duty cycle in percent
    #[structopt(name = "right")]
    TurnRight {
        duty_pct: u8
    },

    /// Point the camera servo on the given axis (pan or tilt) at the given angle in degrees
    #[structopt(name = "look")]
    PanTilt {
        axis: ServoAxis,

        #[structopt(allow_hyphen_values = true)]
        angle_deg: i8
    }
}

/// The kind of a command, independent of its argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdKind {
    Advance,
    Retreat,
    Brake,
    TurnLeft,
    TurnRight,
    PanTilt(ServoAxis)
}

/// Axis of the camera mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServoAxis {
    Pan,
    Tilt
}

/// Possible parsing errors.
#[derive(Debug, Error)]
pub enum TcParseError {
    #[error("Control message contains invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("Control message is not a JSON object")]
    NotAnObject,

    #[error("Control message has no command code")]
    MissingCommand,

    #[error("Control message field \"{0}\" is not an integer (got {1})")]
    NotAnInteger(&'static str, String),

    #[error("Unknown command code {0}")]
    UnknownCommand(i64),

    #[error("Command {0:?} is expected to have a value but it doesn't")]
    MissingValue(CmdKind),

    #[error("Value {value} is out of range for command {kind:?}")]
    ValueOutOfRange {
        kind: CmdKind,
        value: i64
    }
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl CarCmd {
    /// Parse a command from a JSON control message.
    pub fn from_json(json_str: &str) -> Result<Self, TcParseError> {
        let val: Value = serde_json::from_str(json_str)
            .map_err(TcParseError::InvalidJson)?;

        let obj = val.as_object().ok_or(TcParseError::NotAnObject)?;

        let command = match obj.get("command") {
            Some(c) => c.as_i64()
                .ok_or_else(|| TcParseError::NotAnInteger("command", c.to_string()))?,
            None => return Err(TcParseError::MissingCommand)
        };

        let value = match obj.get("value") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_i64()
                .ok_or_else(|| TcParseError::NotAnInteger("value", v.to_string()))?)
        };

        Self::from_control_msg(&ControlMsg { command, value })
    }

    /// Validate a raw control message into a command.
    pub fn from_control_msg(msg: &ControlMsg) -> Result<Self, TcParseError> {
        let kind = CmdKind::from_code(msg.command)
            .ok_or(TcParseError::UnknownCommand(msg.command))?;

        Ok(match kind {
            CmdKind::Advance => CarCmd::Advance { duty_pct: duty(kind, msg.value)? },
            CmdKind::Retreat => CarCmd::Retreat { duty_pct: duty(kind, msg.value)? },
            // Any value sent with a brake is ignored
            CmdKind::Brake => CarCmd::Brake,
            CmdKind::TurnLeft => CarCmd::TurnLeft { duty_pct: duty(kind, msg.value)? },
            CmdKind::TurnRight => CarCmd::TurnRight { duty_pct: duty(kind, msg.value)? },
            CmdKind::PanTilt(axis) => CarCmd::PanTilt {
                axis,
                angle_deg: angle(kind, msg.value)?
            }
        })
    }

    /// Check that the command's argument is within its allowed range.
    ///
    /// Commands built by parsing are always valid, this is for commands built by hand, for
    /// instance from the command line.
    pub fn validate(&self) -> Result<(), TcParseError> {
        Self::from_control_msg(&self.to_control_msg()).map(|_| ())
    }

    /// Get the wire representation of this command.
    pub fn to_control_msg(&self) -> ControlMsg {
        let value = match *self {
            CarCmd::Advance { duty_pct }
            | CarCmd::Retreat { duty_pct }
            | CarCmd::TurnLeft { duty_pct }
            | CarCmd::TurnRight { duty_pct } => Some(duty_pct as i64),
            CarCmd::Brake => None,
            CarCmd::PanTilt { angle_deg, .. } => Some(angle_deg as i64)
        };

        ControlMsg {
            command: self.kind().code(),
            value
        }
    }

    /// Serialise this command as a JSON control message.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_control_msg())
    }

    pub fn kind(&self) -> CmdKind {
        match self {
            CarCmd::Advance { .. } => CmdKind::Advance,
            CarCmd::Retreat { .. } => CmdKind::Retreat,
            CarCmd::Brake => CmdKind::Brake,
            CarCmd::TurnLeft { .. } => CmdKind::TurnLeft,
            CarCmd::TurnRight { .. } => CmdKind::TurnRight,
            CarCmd::PanTilt { axis, .. } => CmdKind::PanTilt(*axis)
        }
    }
}

impl CmdKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(CmdKind::Advance),
            2 => Some(CmdKind::Retreat),
            3 => Some(CmdKind::Brake),
            4 => Some(CmdKind::TurnLeft),
            5 => Some(CmdKind::TurnRight),
            6 => Some(CmdKind::PanTilt(ServoAxis::Pan)),
            7 => Some(CmdKind::PanTilt(ServoAxis::Tilt)),
            _ => None
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            CmdKind::Advance => 1,
            CmdKind::Retreat => 2,
            CmdKind::Brake => 3,
            CmdKind::TurnLeft => 4,
            CmdKind::TurnRight => 5,
            CmdKind::PanTilt(ServoAxis::Pan) => 6,
            CmdKind::PanTilt(ServoAxis::Tilt) => 7
        }
    }
}

impl FromStr for ServoAxis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pan" | "h" => Ok(ServoAxis::Pan),
            "tilt" | "v" => Ok(ServoAxis::Tilt),
            _ => Err(format!("Expected \"pan\" or \"tilt\", got \"{}\"", s))
        }
    }
}

impl fmt::Display for ServoAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServoAxis::Pan => write!(f, "pan"),
            ServoAxis::Tilt => write!(f, "tilt")
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn duty(kind: CmdKind, value: Option<i64>) -> Result<u8, TcParseError> {
    let value = value.ok_or(TcParseError::MissingValue(kind))?;

    if !(0..=DUTY_MAX_PCT).contains(&value) {
        return Err(TcParseError::ValueOutOfRange { kind, value })
    }

    Ok(value as u8)
}

fn angle(kind: CmdKind, value: Option<i64>) -> Result<i8, TcParseError> {
    let value = value.ok_or(TcParseError::MissingValue(kind))?;

    if !(-SERVO_MAX_DEG..=SERVO_MAX_DEG).contains(&value) {
        return Err(TcParseError::ValueOutOfRange { kind, value })
    }

    Ok(value as i8)
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_drive() {
        assert_eq!(
            CarCmd::from_json(r#"{"command": 1, "value": 50}"#).unwrap(),
            CarCmd::Advance { duty_pct: 50 }
        );
        assert_eq!(
            CarCmd::from_json(r#"{"command": 5, "value": 100}"#).unwrap(),
            CarCmd::TurnRight { duty_pct: 100 }
        );
    }

    #[test]
    fn test_parse_brake_ignores_value() {
        assert_eq!(CarCmd::from_json(r#"{"command": 3}"#).unwrap(), CarCmd::Brake);
        assert_eq!(
            CarCmd::from_json(r#"{"command": 3, "value": null}"#).unwrap(),
            CarCmd::Brake
        );
        assert_eq!(
            CarCmd::from_json(r#"{"command": 3, "value": 1234}"#).unwrap(),
            CarCmd::Brake
        );
    }

    #[test]
    fn test_parse_look() {
        assert_eq!(
            CarCmd::from_json(r#"{"command": 6, "value": -90}"#).unwrap(),
            CarCmd::PanTilt { axis: ServoAxis::Pan, angle_deg: -90 }
        );
        assert_eq!(
            CarCmd::from_json(r#"{"command": 7, "value": 45}"#).unwrap(),
            CarCmd::PanTilt { axis: ServoAxis::Tilt, angle_deg: 45 }
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            CarCmd::from_json("not json"),
            Err(TcParseError::InvalidJson(_))
        ));
        assert!(matches!(CarCmd::from_json("[1, 2]"), Err(TcParseError::NotAnObject)));
        assert!(matches!(
            CarCmd::from_json(r#"{"value": 2}"#),
            Err(TcParseError::MissingCommand)
        ));
        assert!(matches!(
            CarCmd::from_json(r#"{"command": 9}"#),
            Err(TcParseError::UnknownCommand(9))
        ));
        assert!(matches!(
            CarCmd::from_json(r#"{"command": 1}"#),
            Err(TcParseError::MissingValue(CmdKind::Advance))
        ));
        assert!(matches!(
            CarCmd::from_json(r#"{"command": 1, "value": 50.5}"#),
            Err(TcParseError::NotAnInteger("value", _))
        ));
        assert!(matches!(
            CarCmd::from_json(r#"{"command": "1", "value": 50}"#),
            Err(TcParseError::NotAnInteger("command", _))
        ));
        assert!(matches!(
            CarCmd::from_json(r#"{"command": 2, "value": 101}"#),
            Err(TcParseError::ValueOutOfRange { value: 101, .. })
        ));
        assert!(matches!(
            CarCmd::from_json(r#"{"command": 4, "value": -1}"#),
            Err(TcParseError::ValueOutOfRange { value: -1, .. })
        ));
        assert!(matches!(
            CarCmd::from_json(r#"{"command": 7, "value": 91}"#),
            Err(TcParseError::ValueOutOfRange { value: 91, .. })
        ));
    }

    #[test]
    fn test_control_msg_wire_form() {
        let json = CarCmd::PanTilt { axis: ServoAxis::Tilt, angle_deg: -30 }
            .to_json()
            .unwrap();
        assert_eq!(json, r#"{"command":7,"value":-30}"#);

        let json = CarCmd::Brake.to_json().unwrap();
        assert_eq!(json, r#"{"command":3,"value":null}"#);
        assert_eq!(CarCmd::from_json(&json).unwrap(), CarCmd::Brake);
    }

    #[test]
    fn test_validate() {
        assert!(CarCmd::Advance { duty_pct: 100 }.validate().is_ok());
        assert!(CarCmd::Advance { duty_pct: 101 }.validate().is_err());
        assert!(CarCmd::PanTilt { axis: ServoAxis::Pan, angle_deg: -91 }.validate().is_err());
    }

    #[test]
    fn test_structopt_grammar() {
        let cmd = CarCmd::from_iter_safe(&["car", "look", "pan", "-45"]).unwrap();
        assert_eq!(cmd, CarCmd::PanTilt { axis: ServoAxis::Pan, angle_deg: -45 });

        let cmd = CarCmd::from_iter_safe(&["car", "adv", "30"]).unwrap();
        assert_eq!(cmd, CarCmd::Advance { duty_pct: 30 });

        assert!(CarCmd::from_iter_safe(&["car", "look", "roll", "10"]).is_err());
    }
}
