//! # Bounded Channel
//!
//! Fixed capacity FIFO queues connecting the car's tasks. Pushing to a full channel blocks the
//! producer until a slot is free, popping from an empty channel blocks the consumer until an item
//! arrives. Items are never dropped by the channel itself.
//!
//! Channels live for the whole process. The only way a channel disconnects is every handle on
//! one side being dropped, which happens at shutdown and in tests.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{fmt, time::Duration};
use crossbeam_channel::{
    self as cbc, RecvTimeoutError, SendTimeoutError, TryRecvError, TrySendError
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Producing half of a bounded channel.
pub struct ChanTx<T> {
    name: &'static str,
    capacity: usize,
    tx: cbc::Sender<T>
}

/// Consuming half of a bounded channel.
///
/// Not `Clone`, each channel has a single consumer.
pub struct ChanRx<T> {
    name: &'static str,
    capacity: usize,
    rx: cbc::Receiver<T>
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel \"{0}\" must have a non-zero capacity")]
    ZeroCapacity(&'static str),

    #[error("Channel \"{0}\" is disconnected")]
    Disconnected(&'static str)
}

/// A push that could not complete. The item is handed back to the caller.
pub enum PushError<T> {
    /// The channel was full (non-blocking push only)
    Full(T),

    /// The channel stayed full for the whole timeout
    Timeout(T),

    /// The consumer is gone
    Disconnected(T)
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Create a new bounded channel with the given capacity.
///
/// `name` is only used in logs and errors.
pub fn bounded<T>(name: &'static str, capacity: usize) -> Result<(ChanTx<T>, ChanRx<T>), ChannelError> {
    if capacity == 0 {
        return Err(ChannelError::ZeroCapacity(name))
    }

    let (tx, rx) = cbc::bounded(capacity);

    Ok((
        ChanTx { name, capacity, tx },
        ChanRx { name, capacity, rx }
    ))
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<T> ChanTx<T> {
    /// Push an item to the tail of the channel, blocking until there is space.
    pub fn push(&self, item: T) -> Result<(), ChannelError> {
        self.tx.send(item).map_err(|_| ChannelError::Disconnected(self.name))
    }

    /// Push an item without blocking.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(i) => PushError::Full(i),
            TrySendError::Disconnected(i) => PushError::Disconnected(i)
        })
    }

    /// Push an item, blocking for at most `timeout` waiting for space.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        self.tx.send_timeout(item, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(i) => PushError::Timeout(i),
            SendTimeoutError::Disconnected(i) => PushError::Disconnected(i)
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for ChanTx<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            capacity: self.capacity,
            tx: self.tx.clone()
        }
    }
}

impl<T> ChanRx<T> {
    /// Pop an item from the head of the channel, blocking until one is available.
    pub fn pop(&self) -> Result<T, ChannelError> {
        self.rx.recv().map_err(|_| ChannelError::Disconnected(self.name))
    }

    /// Pop an item, blocking for at most `timeout`. Returns `Ok(None)` if nothing arrived.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(i) => Ok(Some(i)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Disconnected(self.name))
        }
    }

    /// Pop an item without blocking.
    pub fn try_pop(&self) -> Result<Option<T>, ChannelError> {
        match self.rx.try_recv() {
            Ok(i) => Ok(Some(i)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Disconnected(self.name))
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> PushError<T> {
    /// Take back the item which could not be pushed.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(i) | PushError::Timeout(i) | PushError::Disconnected(i) => i
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, PushError::Disconnected(_))
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => write!(f, "Full(..)"),
            PushError::Timeout(_) => write!(f, "Timeout(..)"),
            PushError::Disconnected(_) => write!(f, "Disconnected(..)")
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
