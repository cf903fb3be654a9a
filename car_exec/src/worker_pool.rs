//! # Async Admission Worker Pool
//!
//! A fixed number of worker threads run long lived connection handlers, so the server's reactor
//! never blocks on them. Admission is controlled by a counting signal of permits:
//!
//! - an idle worker gives back its permit *before* waiting for work, so an available permit
//!   always means a worker is free to pick up the next job,
//! - the reactor takes a permit without blocking ([`WorkerPool::try_admit`]) and refuses the
//!   request as busy if there is none,
//! - an admitted job is handed to the workers through a single slot queue, waiting at most
//!   [`HANDOFF_TIMEOUT`].
//!
//! At most `num_workers` handlers therefore run at once, and the next request is refused rather
//! than queued.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, atomic::{AtomicUsize, Ordering}},
    thread::{self, JoinHandle},
    time::{Duration, Instant}
};
use log::{debug, error, info};

use crate::{
    channel::{self, ChanRx, ChanTx, ChannelError, PushError},
    signal::Signal
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Maximum time an admitted job waits for a worker to pick it up.
pub const HANDOFF_TIMEOUT: Duration = Duration::from_millis(100);

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send + 'static>;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct WorkerPool {
    permits: Signal,
    jobs_tx: ChanTx<Job>,
    in_flight: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>
}

/// Handle for taking permits from a pool, used where the pool itself can't be borrowed.
#[derive(Clone)]
pub struct Admitter {
    permits: Signal,
    jobs_tx: ChanTx<Job>
}

/// A permit taken from the pool. Dropping it unused gives the permit back.
pub struct Admission {
    permits: Signal,
    jobs_tx: ChanTx<Job>,
    used: bool
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("A worker pool needs at least one worker")]
    NoWorkers,

    #[error("Could not create the job queue: {0}")]
    Channel(#[from] ChannelError),

    #[error("Could not spawn a worker: {0}")]
    Spawn(io::Error),

    #[error("Only {ready} of {expected} workers were ready in time")]
    NotReady {
        ready: usize,
        expected: usize
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("No workers available")]
    Busy,

    #[error("No worker picked up the job within {0:?}")]
    HandoffTimeout(Duration),

    #[error("The worker pool has shut down")]
    Closed
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl WorkerPool {
    /// Spawn `num_workers` workers and wait up to `ready_timeout` for all of them to be idle.
    pub fn new(num_workers: usize, ready_timeout: Duration) -> Result<Self, PoolError> {
        if num_workers == 0 {
            return Err(PoolError::NoWorkers)
        }

        let permits = Signal::counting("worker_permits", num_workers);
        let (jobs_tx, jobs_rx) = channel::bounded::<Job>("worker_jobs", 1)?;
        let jobs_rx = Arc::new(jobs_rx);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(num_workers);

        for i in 0..num_workers {
            let permits = permits.clone();
            let jobs_rx = jobs_rx.clone();
            let in_flight = in_flight.clone();

            workers.push(
                thread::Builder::new()
                    .name(format!("worker_pool::worker_{}", i))
                    .spawn(move || worker(permits, jobs_rx, in_flight))
                    .map_err(PoolError::Spawn)?
            );
        }

        // Wait for every worker to post its first permit
        let start = Instant::now();
        while permits.count() < num_workers {
            if start.elapsed() > ready_timeout {
                return Err(PoolError::NotReady {
                    ready: permits.count(),
                    expected: num_workers
                })
            }
            thread::sleep(Duration::from_millis(1));
        }

        info!("Worker pool ready with {} workers", num_workers);

        Ok(Self {
            permits,
            jobs_tx,
            in_flight,
            workers
        })
    }

    /// Take a permit without blocking.
    pub fn try_admit(&self) -> Result<Admission, AdmissionError> {
        self.admitter().try_admit()
    }

    pub fn admitter(&self) -> Admitter {
        Admitter {
            permits: self.permits.clone(),
            jobs_tx: self.jobs_tx.clone()
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Number of jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of permits currently available.
    pub fn available(&self) -> usize {
        self.permits.count()
    }
}

impl Admitter {
    /// Take a permit without blocking.
    pub fn try_admit(&self) -> Result<Admission, AdmissionError> {
        if self.permits.try_take() {
            Ok(Admission {
                permits: self.permits.clone(),
                jobs_tx: self.jobs_tx.clone(),
                used: false
            })
        }
        else {
            Err(AdmissionError::Busy)
        }
    }
}

impl Admission {
    /// Hand the job to the idle worker this permit stands for.
    ///
    /// If no worker picks it up within [`HANDOFF_TIMEOUT`] the job is dropped and the permit
    /// given back.
    pub fn submit<F>(mut self, job: F) -> Result<(), AdmissionError>
    where
        F: FnOnce() + Send + 'static
    {
        self.used = true;

        match self.jobs_tx.push_timeout(Box::new(job), HANDOFF_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.permits.give();
                match e {
                    PushError::Disconnected(_) => Err(AdmissionError::Closed),
                    _ => Err(AdmissionError::HandoffTimeout(HANDOFF_TIMEOUT))
                }
            }
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.used {
            self.permits.give();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn worker(permits: Signal, jobs_rx: Arc<ChanRx<Job>>, in_flight: Arc<AtomicUsize>) {
    loop {
        // Idle, the permit goes back before waiting for work
        permits.give();

        let job = match jobs_rx.pop() {
            Ok(j) => j,
            Err(_) => break
        };

        in_flight.fetch_add(1, Ordering::SeqCst);
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Connection handler panicked");
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    debug!("Job queue closed, worker exiting");
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::signal::Signal;

    fn wait_until<F: Fn() -> bool>(f: F) {
        let start = Instant::now();
        while !f() {
            assert!(start.elapsed() < Duration::from_secs(2), "condition never met");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_admission_bound() {
        let pool = WorkerPool::new(2, Duration::from_secs(1)).unwrap();
        assert_eq!(pool.available(), 2);

        let release = Signal::counting("release", 2);

        for _ in 0..2 {
            let release = release.clone();
            pool.try_admit().unwrap().submit(move || release.take()).unwrap();
        }
        wait_until(|| pool.in_flight() == 2);

        // The third request is refused straight away
        assert_eq!(pool.try_admit().err(), Some(AdmissionError::Busy));

        release.give();
        wait_until(|| pool.available() == 1);
        assert_eq!(pool.in_flight(), 1);
        assert!(pool.try_admit().is_ok());

        release.give();
        wait_until(|| pool.available() == 2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_unused_admission_returns_permit() {
        let pool = WorkerPool::new(1, Duration::from_secs(1)).unwrap();

        let admission = pool.try_admit().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.try_admit().is_err());

        drop(admission);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_admitter_shares_permits() {
        let pool = WorkerPool::new(1, Duration::from_secs(1)).unwrap();
        let admitter = pool.admitter();

        let admission = admitter.try_admit().unwrap();
        assert_eq!(pool.try_admit().err(), Some(AdmissionError::Busy));

        drop(admission);
        assert!(pool.try_admit().is_ok());
    }

    #[test]
    fn test_panicking_job() {
        let pool = WorkerPool::new(1, Duration::from_secs(1)).unwrap();

        pool.try_admit().unwrap().submit(|| panic!("handler failure")).unwrap();

        // The worker survives and becomes available again
        wait_until(|| pool.available() == 1 && pool.in_flight() == 0);

        let done = Signal::binary("done");
        let d = done.clone();
        pool.try_admit().unwrap().submit(move || { d.give(); }).unwrap();
        assert!(done.take_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn test_no_workers() {
        assert!(matches!(WorkerPool::new(0, Duration::from_secs(1)), Err(PoolError::NoWorkers)));
    }
}
