//! # Car Executable Parameters
//!
//! This module provides parameters for the car executable. Every section has defaults, so a
//! parameter file only needs to name the values it changes.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::time::Duration;
use comms_if::net::SocketOptions;
use serde::{Serialize, Deserialize};

use crate::{actuator::pca9685::ChannelMap, server::ServerConfig, tm::SensorSet};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CarExecParams {
    pub server: ServerParams,
    pub workers: WorkerParams,
    pub channels: ChannelParams,
    pub camera: CameraParams,
    pub actuators: ActuatorParams,
    pub telemetry: TelemetryParams,
    pub session: SessionParams
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerParams {
    /// Address the server listens on
    pub bind_addr: String,

    /// Maximum number of open connections. Defaults to one per worker plus the control
    /// connection.
    pub max_connections: Option<usize>,

    /// Maximum number of WebSocket handshakes in progress at once
    pub max_pending_upgrades: usize,

    pub handshake_timeout_ms: u64,

    /// Time the reactor waits for a message on each connection per pass
    pub poll_timeout_ms: u64,

    pub write_timeout_ms: u64,

    /// Sleep between reactor passes that found nothing to do
    pub idle_sleep_ms: u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerParams {
    /// Number of session workers, and so of concurrent streaming/telemetry connections
    pub count: usize,

    /// Time allowed for every worker to come up at boot
    pub ready_timeout_ms: u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelParams {
    pub frame_depth: usize,
    pub command_depth: usize,
    pub telemetry_depth: usize
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraParams {
    pub backend: CameraBackend,

    /// V4L2 device, only used by the `v4l` backend
    pub device: String,

    pub width: u32,
    pub height: u32,

    /// JPEG quality, 1 (worst) to 100 (best)
    pub jpeg_quality: u8,

    pub frame_rate: u32,

    /// Number of frame buffers in the pool
    pub num_buffers: usize,

    pub acquire_timeout_ms: u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorParams {
    pub backend: ActuatorBackend,

    /// I2C bus of the PWM board
    pub i2c_bus: u8,

    /// 7 bit I2C address of the PWM board
    pub address: u8,

    pub channels: ChannelMap
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryParams {
    pub backend: TelemetryBackend,
    pub period_ms: u64,
    pub sensors: SensorSet,

    /// Wireless interface the RSSI is read from
    pub iface: String,

    pub encoder_slots: u32,
    pub wheel_diameter_m: f64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    /// Longest time a session waits on its source before checking for a stop
    pub poll_ms: u64
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraBackend {
    Sim,
    V4l
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorBackend {
    Sim,
    Pca9685
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryBackend {
    Sim,
    Host
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CarExecParams {
    pub fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::for_workers(&self.server.bind_addr, self.workers.count);

        if let Some(max) = self.server.max_connections {
            config.max_connections = max;
        }
        config.max_pending_upgrades = self.server.max_pending_upgrades;

        config.socket_options = SocketOptions {
            handshake_timeout: Duration::from_millis(self.server.handshake_timeout_ms),
            poll_timeout: Duration::from_millis(self.server.poll_timeout_ms),
            write_timeout: Duration::from_millis(self.server.write_timeout_ms),
            ..SocketOptions::default()
        };
        config.idle_sleep = Duration::from_millis(self.server.idle_sleep_ms);

        config
    }
}

impl Default for ServerParams {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
            max_connections: None,
            max_pending_upgrades: 8,
            handshake_timeout_ms: 2000,
            poll_timeout_ms: 5,
            write_timeout_ms: 5000,
            idle_sleep_ms: 2
        }
    }
}

impl Default for WorkerParams {
    fn default() -> Self {
        Self {
            count: 2,
            ready_timeout_ms: 1000
        }
    }
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            frame_depth: 2,
            command_depth: 2,
            telemetry_depth: 2
        }
    }
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            backend: CameraBackend::Sim,
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            jpeg_quality: 80,
            frame_rate: 15,
            num_buffers: 2,
            acquire_timeout_ms: 1000
        }
    }
}

impl Default for ActuatorParams {
    fn default() -> Self {
        Self {
            backend: ActuatorBackend::Sim,
            i2c_bus: 1,
            address: 0x40,
            channels: ChannelMap::default()
        }
    }
}

impl Default for TelemetryParams {
    fn default() -> Self {
        Self {
            backend: TelemetryBackend::Sim,
            period_ms: 500,
            sensors: SensorSet::default(),
            iface: "wlan0".into(),
            encoder_slots: 20,
            wheel_diameter_m: 0.066
        }
    }
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            poll_ms: 50
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partial_file() {
        let params: CarExecParams = util::params::from_str(r#"
            [server]
            bind_addr = "127.0.0.1:9000"

            [camera]
            backend = "v4l"
            width = 320

            [telemetry]
            period_ms = 250
            sensors = { gyroscope = true }
        "#).unwrap();

        assert_eq!(params.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(params.camera.backend, CameraBackend::V4l);
        assert_eq!(params.camera.width, 320);
        assert_eq!(params.camera.height, 480);
        assert_eq!(params.telemetry.period_ms, 250);
        assert!(params.telemetry.sensors.gyroscope);
        assert!(params.telemetry.sensors.rssi);
        assert_eq!(params.actuators.backend, ActuatorBackend::Sim);
        assert_eq!(params.workers.count, 2);
        assert_eq!(params.channels.frame_depth, 2);
    }

    #[test]
    fn test_server_config() {
        let mut params = CarExecParams::default();
        assert_eq!(params.server_config().max_connections, 3);

        params.server.max_connections = Some(8);
        params.server.poll_timeout_ms = 1;
        let config = params.server_config();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.socket_options.poll_timeout, Duration::from_millis(1));
        assert!(config.socket_options.nodelay);
    }
}
