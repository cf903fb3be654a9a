//! # Frame Source
//!
//! Video frames are captured into a small fixed pool of buffers, the same way the camera driver
//! owns a fixed number of frame buffers. A [`Frame`] holds one pool buffer while it travels from
//! the capture task, through the frame channel, to the streaming session. Dropping the frame
//! returns the buffer to the pool, so a buffer is released exactly once whatever path the frame
//! takes: sent, failed to send, or discarded during a session stop.
//!
//! With all buffers outstanding `acquire` blocks, which stalls the capture task. This is the
//! backpressure surface between the camera and the network.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Simulated camera producing a JPEG test pattern.
pub mod sim;

/// V4L2 camera capture.
#[cfg(feature = "v4l")]
pub mod v4l;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    fmt,
    sync::{Arc, atomic::{AtomicU64, Ordering}},
    time::Duration
};
use chrono::{DateTime, Utc};
use crossbeam_channel::{self as cbc, Receiver, Sender};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// A device which can capture an encoded frame into a buffer.
pub trait FrameCapture {
    /// Capture one frame, replacing the contents of `buf`.
    ///
    /// Blocks until the device has a frame available.
    fn capture(&mut self, buf: &mut Vec<u8>) -> Result<(), FrameError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A captured frame, holding one buffer of its pool until dropped.
pub struct Frame {
    buf: Option<Vec<u8>>,
    seq: u64,
    captured_at: DateTime<Utc>,
    pool: FramePool
}

/// A fixed pool of frame buffers. Clones share the same pool.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>
}

/// Statistics of a frame pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of frames handed out since the pool was created
    pub acquired: u64,

    /// Number of frames returned since the pool was created
    pub released: u64,

    /// Number of buffers currently free
    pub free: usize
}

/// Produces frames by capturing into buffers of a pool.
pub struct FrameSource<C> {
    pool: FramePool,
    capture: C,
    acquire_timeout: Duration,
    next_seq: u64
}

struct PoolInner {
    num_buffers: usize,
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    acquired: AtomicU64,
    released: AtomicU64
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("A frame pool needs at least one buffer")]
    NoBuffers,

    #[error("No frame buffer became free within {0:?}")]
    Timeout(Duration),

    #[error("Could not capture a frame: {0}")]
    Capture(String),

    #[error("Could not initialise the camera: {0}")]
    DeviceInit(String)
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Frame {
    /// The encoded frame data.
    pub fn data(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Sequence number of the frame within its source, starting at 0.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("len", &self.len())
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

impl FramePool {
    /// Create a pool of `num_buffers` buffers, each preallocated with `buffer_capacity` bytes.
    pub fn new(num_buffers: usize, buffer_capacity: usize) -> Result<Self, FrameError> {
        if num_buffers == 0 {
            return Err(FrameError::NoBuffers)
        }

        let (free_tx, free_rx) = cbc::bounded(num_buffers);
        for _ in 0..num_buffers {
            free_tx.try_send(Vec::with_capacity(buffer_capacity))
                .map_err(|_| FrameError::NoBuffers)?;
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                num_buffers,
                free_tx,
                free_rx,
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0)
            })
        })
    }

    pub fn num_buffers(&self) -> usize {
        self.inner.num_buffers
    }

    pub fn stats(&self) -> PoolStats {
        // Read released first so that acquired >= released in the snapshot
        let released = self.inner.released.load(Ordering::SeqCst);
        let acquired = self.inner.acquired.load(Ordering::SeqCst);

        PoolStats {
            acquired,
            released,
            free: self.inner.free_rx.len()
        }
    }

    /// Number of frames currently held outside the pool.
    pub fn outstanding(&self) -> u64 {
        let stats = self.stats();
        stats.acquired.saturating_sub(stats.released)
    }

    /// Wrap an already filled buffer into a frame, counting it as acquired.
    fn issue(&self, buf: Vec<u8>, seq: u64) -> Frame {
        self.inner.acquired.fetch_add(1, Ordering::SeqCst);

        Frame {
            buf: Some(buf),
            seq,
            captured_at: Utc::now(),
            pool: self.clone()
        }
    }

    fn take_buffer(&self, timeout: Duration) -> Result<Vec<u8>, FrameError> {
        self.inner.free_rx.recv_timeout(timeout)
            .map_err(|_| FrameError::Timeout(timeout))
    }

    /// Return the buffer of a dropped frame.
    fn release(&self, buf: Vec<u8>) {
        self.inner.released.fetch_add(1, Ordering::SeqCst);
        self.recycle(buf);
    }

    /// Return a buffer which never became a frame.
    fn recycle(&self, mut buf: Vec<u8>) {
        buf.clear();

        // The free list holds exactly num_buffers so this can't be full
        self.inner.free_tx.try_send(buf).ok();
    }
}

impl<C: FrameCapture> FrameSource<C> {
    pub fn new(pool: FramePool, capture: C, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            capture,
            acquire_timeout,
            next_seq: 0
        }
    }

    /// Acquire the next frame.
    ///
    /// Blocks until a pool buffer is free, then until the device delivers a frame. Returns
    /// [`FrameError::Timeout`] if no buffer becomes free within the acquire timeout.
    pub fn acquire(&mut self) -> Result<Frame, FrameError> {
        let mut buf = self.pool.take_buffer(self.acquire_timeout)?;

        if let Err(e) = self.capture.capture(&mut buf) {
            self.pool.recycle(buf);
            return Err(e)
        }

        let frame = self.pool.issue(buf, self.next_seq);
        self.next_seq += 1;

        Ok(frame)
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }
}

impl FrameError {
    /// Transient errors are recovered by retrying the acquisition.
    pub fn is_transient(&self) -> bool {
        matches!(self, FrameError::Timeout(_) | FrameError::Capture(_))
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
