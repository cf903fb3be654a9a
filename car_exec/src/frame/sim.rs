//! Simulated camera
//!
//! Produces JPEG frames of a test pattern (a bar sweeping across a gradient) at a fixed frame
//! rate, so the full streaming path can be exercised without camera hardware.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{thread, time::{Duration, Instant}};
use image::{codecs::jpeg::JpegEncoder, ColorType, Rgb, RgbImage};

use super::{FrameCapture, FrameError};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct SimCamera {
    width: u32,
    height: u32,
    jpeg_quality: u8,
    frame_period: Duration,
    next_frame_at: Option<Instant>,
    frame_count: u32
}

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Width of the sweeping bar in pixels
const BAR_WIDTH: u32 = 16;

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SimCamera {
    /// Create a new simulated camera.
    ///
    /// `jpeg_quality` is 1 (worst) to 100 (best). A `frame_rate` of zero disables pacing and
    /// frames are produced as fast as they can be encoded.
    pub fn new(width: u32, height: u32, jpeg_quality: u8, frame_rate: u32) -> Self {
        let frame_period = match frame_rate {
            0 => Duration::from_secs(0),
            r => Duration::from_secs(1) / r
        };

        Self {
            width: width.max(1),
            height: height.max(1),
            jpeg_quality: jpeg_quality.max(1).min(100),
            frame_period,
            next_frame_at: None,
            frame_count: 0
        }
    }

    fn pace(&mut self) {
        let now = Instant::now();

        if let Some(t) = self.next_frame_at {
            if t > now {
                thread::sleep(t - now);
            }
        }

        self.next_frame_at = Some(Instant::now() + self.frame_period);
    }

    fn render(&self) -> RgbImage {
        let bar_x = self.frame_count.wrapping_mul(4) % self.width;
        let width = self.width;
        let height = self.height;

        RgbImage::from_fn(width, height, |x, y| {
            if x >= bar_x && x < bar_x + BAR_WIDTH {
                Rgb([255, 255, 255])
            }
            else {
                Rgb([
                    (x * 255 / width) as u8,
                    (y * 255 / height) as u8,
                    96
                ])
            }
        })
    }
}

impl FrameCapture for SimCamera {
    fn capture(&mut self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        self.pace();

        let img = self.render();
        self.frame_count = self.frame_count.wrapping_add(1);

        buf.clear();
        JpegEncoder::new_with_quality(&mut *buf, self.jpeg_quality)
            .encode(img.as_raw(), self.width, self.height, ColorType::Rgb8)
            .map_err(|e| FrameError::Capture(e.to_string()))
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
