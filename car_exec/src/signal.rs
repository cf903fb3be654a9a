//! # Counted Signal
//!
//! A give/take signal used between tasks for start, stop and acknowledgement events, and for
//! worker permits. Giving increments the count up to a maximum, taking decrements it, blocking
//! while it is zero.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::time::Duration;
use crossbeam_channel::{self as cbc, Receiver, Sender};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A counted signal. Clones share the same count.
#[derive(Clone)]
pub struct Signal {
    name: &'static str,
    max: usize,
    tx: Sender<()>,
    rx: Receiver<()>
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Signal {
    /// Create a signal whose count saturates at `max` (at least 1).
    pub fn counting(name: &'static str, max: usize) -> Self {
        let max = max.max(1);
        let (tx, rx) = cbc::bounded(max);

        Self { name, max, tx, rx }
    }

    /// Create a signal with a maximum count of one.
    pub fn binary(name: &'static str) -> Self {
        Self::counting(name, 1)
    }

    /// Increment the count. Returns `false` if the count was already at its maximum, in which
    /// case the give has no effect.
    pub fn give(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    /// Decrement the count, blocking until it is non-zero.
    pub fn take(&self) {
        // The signal holds both ends of its channel so the receive can't disconnect
        self.rx.recv().ok();
    }

    /// Decrement the count if it is non-zero, without blocking.
    pub fn try_take(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Decrement the count, blocking for at most `timeout`. Returns `false` on timeout.
    pub fn take_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Current count.
    pub fn count(&self) -> usize {
        self.rx.len()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use std::{thread, time::Instant};

    #[test]
    fn test_counting() {
        let sig = Signal::counting("test", 2);

        assert!(!sig.try_take());
        assert!(sig.give());
        assert!(sig.give());
        // Saturated
        assert!(!sig.give());
        assert_eq!(sig.count(), 2);

        assert!(sig.try_take());
        sig.take();
        assert_eq!(sig.count(), 0);
        assert!(!sig.take_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_cross_thread() {
        let sig = Signal::binary("test");
        let giver = sig.clone();

        let start = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            giver.give();
        });

        sig.take();
        assert!(start.elapsed() >= Duration::from_millis(20));
        handle.join().unwrap();
    }
}
