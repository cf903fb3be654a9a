//! # Telemetry module
//!
//! Telemetry records sampled on the car and streamed to the operator as JSON text.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Format of the record timestamp, UTC with second resolution.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A three axis sensor reading.
pub type Vec3 = [f32; 3];

/// A single telemetry sample.
///
/// Only the timestamp is mandatory, the other fields are present when the car is fitted with the
/// matching sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Time the sample was taken
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,

    /// WiFi signal strength in dBm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,

    /// Ground speed in km/h
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerometer: Option<Vec3>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnetometer: Option<Vec3>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gyroscope: Option<Vec3>
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl TelemetryRecord {
    /// Create an empty record taken at the given time.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            rssi: None,
            speed: None,
            accelerometer: None,
            magnetometer: None,
            gyroscope: None
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }
}

mod timestamp {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer
    {
        serializer.serialize_str(&dt.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_json() {
        let mut rec = TelemetryRecord::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap());
        rec.rssi = Some(-61);
        rec.speed = Some(1.5);

        let json = rec.to_json().unwrap();
        assert_eq!(json, r#"{"timestamp":"2024-05-01T12:30:05Z","rssi":-61,"speed":1.5}"#);

        assert_eq!(TelemetryRecord::from_json(&json).unwrap(), rec);
    }

    #[test]
    fn test_record_rejects_bad_timestamp() {
        assert!(TelemetryRecord::from_json(r#"{"timestamp":"yesterday"}"#).is_err());
    }
}
