//! V4L2 camera capture
//!
//! Captures MJPG frames straight from a video device, each driver frame is already a complete
//! JPEG so it is copied into the pool buffer as is.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use rscam::{Camera, Config};

use super::{FrameCapture, FrameError};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct V4lCamera {
    camera: Camera
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl V4lCamera {
    /// Open and start the video device at the given path.
    pub fn new(device: &str, width: u32, height: u32, frame_rate: u32) -> Result<Self, FrameError> {
        let mut camera = Camera::new(device)
            .map_err(|e| FrameError::DeviceInit(format!("{}: {}", device, e)))?;

        camera.start(&Config {
            interval: (1, frame_rate.max(1)),
            resolution: (width, height),
            format: b"MJPG",
            ..Default::default()
        }).map_err(|e| FrameError::DeviceInit(format!("{}: {}", device, e)))?;

        Ok(Self { camera })
    }
}

impl FrameCapture for V4lCamera {
    fn capture(&mut self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        let frame = self.camera.capture()
            .map_err(|e| FrameError::Capture(e.to_string()))?;

        buf.clear();
        buf.extend_from_slice(&frame[..]);

        Ok(())
    }
}
