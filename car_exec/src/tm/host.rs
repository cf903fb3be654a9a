//! Telemetry from the host
//!
//! Reports the WiFi signal strength of a wireless interface, read from `/proc/net/wireless`.
//! The host has no wheel encoder or inertial sensors, those fields are left out.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::fs;
use chrono::Utc;
use log::warn;

use super::{SensorSet, TelemetryError, TelemetryRecord, TelemetrySource};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

const WIRELESS_PATH: &str = "/proc/net/wireless";

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct HostTelemetry {
    iface: String,
    rssi: bool
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl HostTelemetry {
    pub fn new(iface: &str, sensors: SensorSet) -> Self {
        if sensors.speed || sensors.accelerometer || sensors.magnetometer || sensors.gyroscope {
            warn!("Host telemetry only provides RSSI, other configured sensors are ignored");
        }

        Self {
            iface: iface.to_owned(),
            rssi: sensors.rssi
        }
    }
}

impl TelemetrySource for HostTelemetry {
    fn reset(&mut self) {}

    fn read(&mut self) -> Result<TelemetryRecord, TelemetryError> {
        let mut rec = TelemetryRecord::new(Utc::now());

        if self.rssi {
            let contents = fs::read_to_string(WIRELESS_PATH).map_err(TelemetryError::Io)?;

            rec.rssi = Some(parse_wireless_rssi(&contents, &self.iface)
                .ok_or_else(|| TelemetryError::Unavailable(
                    format!("no signal level for {} in {}", self.iface, WIRELESS_PATH)
                ))?);
        }

        Ok(rec)
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Extract the signal level in dBm of `iface` from the contents of `/proc/net/wireless`.
pub fn parse_wireless_rssi(contents: &str, iface: &str) -> Option<i32> {
    contents.lines()
        .filter_map(|l| {
            let mut parts = l.trim().splitn(2, ':');
            match (parts.next(), parts.next()) {
                (Some(name), Some(rest)) if name.trim() == iface => Some(rest),
                _ => None
            }
        })
        .next()
        // Fields: status, link quality, signal level, noise, ...
        .and_then(|rest| rest.split_whitespace().nth(2))
        .and_then(|level| level.trim_end_matches('.').parse::<f32>().ok())
        .map(|level| level.round() as i32)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
