//! # Frame Pipeline
//!
//! The capture task: continuously acquires frames from the frame source and pushes them into the
//! frame channel. It never stops on its own. When nobody is streaming the channel fills, the
//! push blocks and the pool runs dry, so the camera simply idles until a consumer drains the
//! channel again.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{io, thread::{self, JoinHandle}, time::Duration};
use log::{error, info, trace, warn};

use crate::{
    channel::{ChanTx, ChannelError},
    frame::{Frame, FrameCapture, FrameError, FramePool, FrameSource}
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Delay before retrying after the camera failed to deliver a frame.
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(50);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct FramePipeline<C> {
    source: FrameSource<C>,
    frame_tx: ChanTx<Frame>
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Could not push a frame into the frame channel: {0}")]
    Push(ChannelError),

    #[error("Frame source failed: {0}")]
    Source(FrameError)
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<C: FrameCapture> FramePipeline<C> {
    pub fn new(source: FrameSource<C>, frame_tx: ChanTx<Frame>) -> Self {
        Self { source, frame_tx }
    }

    /// Run the capture loop.
    ///
    /// Only returns on a fatal error: a non-transient source error, or the frame channel
    /// disconnecting.
    pub fn run(mut self) -> Result<(), PipelineError> {
        info!(
            "Frame pipeline started ({} buffers, channel \"{}\" of depth {})",
            self.source.pool().num_buffers(),
            self.frame_tx.name(),
            self.frame_tx.capacity()
        );

        loop {
            let frame = match self.source.acquire() {
                Ok(f) => f,
                // Pool exhausted, i.e. no consumer. Expected while nobody is streaming.
                Err(FrameError::Timeout(_)) => continue,
                Err(e) if e.is_transient() => {
                    warn!("Frame acquisition failed, retrying: {}", e);
                    thread::sleep(CAPTURE_RETRY_DELAY);
                    continue
                },
                Err(e) => return Err(PipelineError::Source(e))
            };

            trace!("Captured frame {} ({} bytes)", frame.seq(), frame.len());

            self.frame_tx.push(frame).map_err(PipelineError::Push)?;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Spawn the frame pipeline task.
///
/// The capture device is created by `make_capture` on the task's own thread, since camera
/// handles usually can't move between threads. A failure there, or a fatal error later, is
/// logged and ends the task.
pub fn spawn<C, F>(
    make_capture: F,
    pool: FramePool,
    acquire_timeout: Duration,
    frame_tx: ChanTx<Frame>
) -> io::Result<JoinHandle<()>>
where
    C: FrameCapture,
    F: FnOnce() -> Result<C, FrameError> + Send + 'static
{
    thread::Builder::new()
        .name("frame_pipeline".into())
        .spawn(move || {
            let capture = match make_capture() {
                Ok(c) => c,
                Err(e) => {
                    error!("Could not start the camera: {}", e);
                    return
                }
            };

            let source = FrameSource::new(pool, capture, acquire_timeout);

            if let Err(e) = FramePipeline::new(source, frame_tx).run() {
                error!("Frame pipeline stopped: {}", e);
            }
        })
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel;

    struct Pattern;

    impl FrameCapture for Pattern {
        fn capture(&mut self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
            buf.extend_from_slice(b"frame");
            Ok(())
        }
    }

    #[test]
    fn test_pipeline_order_and_conservation() {
        // One more buffer than the channel depth, so the pipeline ends up blocked in push
        let pool = FramePool::new(3, 8).unwrap();
        let (tx, rx) = channel::bounded("frames", 2).unwrap();

        let jh = spawn(|| Ok(Pattern), pool.clone(), Duration::from_millis(5), tx).unwrap();

        for expected in 0..10 {
            let frame = rx.pop().unwrap();
            assert_eq!(frame.seq(), expected);
            assert_eq!(frame.data(), b"frame");
            assert!(pool.outstanding() <= 3);
        }

        // Dropping the consumer fails the blocked push and stops the pipeline, queued frames are
        // released when the channel goes away with it
        drop(rx);
        jh.join().unwrap();

        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_pipeline_fatal_source() {
        let pool = FramePool::new(2, 8).unwrap();
        let (tx, _rx) = channel::bounded::<Frame>("frames", 2).unwrap();

        let jh = spawn::<Pattern, _>(
            || Err(FrameError::DeviceInit("no camera".into())),
            pool,
            Duration::from_millis(5),
            tx
        ).unwrap();

        // Returns rather than blocking forever
        jh.join().unwrap();
    }
}
