//! Session scenarios driven through the public API with an in-memory connection.

use std::{
    sync::{Arc, Mutex, atomic::{AtomicBool, AtomicUsize, Ordering}},
    thread,
    time::{Duration, Instant}
};
use car_lib::{
    channel::{self, ChanTx},
    frame::{Frame, FrameCapture, FrameError, FramePool, FrameSource},
    session::{self, Handoff, SessionState, SessionStatus, StopOutcome, StreamSession, TelemetrySession},
    tm::{TelemetryError, TelemetryRecord, TelemetrySource, sampler::{self, SamplerCtrl, SamplerState}},
    worker_pool::WorkerPool
};
use chrono::Utc;
use comms_if::net::{ConnError, ConnId, Connection};

// ------------------------------------------------------------------------------------------------
// MOCKS
// ------------------------------------------------------------------------------------------------

/// Writes an incrementing byte into each frame.
struct Scripted(u8);

impl FrameCapture for Scripted {
    fn capture(&mut self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        self.0 = self.0.wrapping_add(1);
        buf.clear();
        buf.extend_from_slice(&[self.0; 16]);
        Ok(())
    }
}

/// Records what is sent to it, optionally taking a while over each send.
struct MockConn {
    id: u64,
    send_delay: Duration,
    sending: AtomicBool,
    binary: Mutex<Vec<Vec<u8>>>,
    text: Mutex<Vec<String>>
}

impl MockConn {
    fn new(id: u64, send_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            send_delay,
            sending: AtomicBool::new(false),
            binary: Mutex::new(Vec::new()),
            text: Mutex::new(Vec::new())
        })
    }

    fn num_binary(&self) -> usize {
        self.binary.lock().unwrap().len()
    }

    fn num_text(&self) -> usize {
        self.text.lock().unwrap().len()
    }
}

impl Connection for MockConn {
    fn id(&self) -> ConnId {
        ConnId(self.id)
    }

    fn send_binary(&self, data: &[u8]) -> Result<(), ConnError> {
        self.sending.store(true, Ordering::SeqCst);
        thread::sleep(self.send_delay);
        self.binary.lock().unwrap().push(data.to_vec());
        self.sending.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn send_text(&self, text: &str) -> Result<(), ConnError> {
        self.text.lock().unwrap().push(text.to_owned());
        Ok(())
    }
}

/// Telemetry source counting its reads.
#[derive(Clone, Default)]
struct CountingSource {
    reads: Arc<AtomicUsize>
}

impl TelemetrySource for CountingSource {
    fn reset(&mut self) {}

    fn read(&mut self) -> Result<TelemetryRecord, TelemetryError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut rec = TelemetryRecord::new(Utc::now());
        rec.rssi = Some(-60);
        Ok(rec)
    }
}

// ------------------------------------------------------------------------------------------------
// HELPERS
// ------------------------------------------------------------------------------------------------

fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
    let start = Instant::now();
    while !f() {
        assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

struct StreamRig {
    pool: FramePool,
    source: FrameSource<Scripted>,
    frame_tx: ChanTx<Frame>,
    handoff: Handoff,
    status: SessionStatus
}

impl StreamRig {
    fn new() -> Self {
        let pool = FramePool::new(4, 16).unwrap();
        let source = FrameSource::new(pool.clone(), Scripted(0), Duration::from_secs(1));
        let (frame_tx, frame_rx) = channel::bounded("frame", 2).unwrap();
        let (handoff, status, _) = session::spawn(
            StreamSession, frame_rx, Duration::from_millis(5)
        ).unwrap();

        Self { pool, source, frame_tx, handoff, status }
    }

    fn push_frame(&mut self) {
        let frame = self.source.acquire().unwrap();
        self.frame_tx.push(frame).unwrap();
    }

    /// Open a session for `conn` the way the server does, on a worker thread.
    fn open(&self, conn: Arc<MockConn>) -> (session::StopRequester, thread::JoinHandle<()>) {
        let (ticket, requester, waiter) = session::ticket(conn);
        let handoff = self.handoff.clone();
        let worker = thread::spawn(move || handoff.attach(ticket, waiter).unwrap());
        (requester, worker)
    }

    /// Open a session for `conn` through a pool worker, the way the server does.
    fn open_pooled(&self, pool: &WorkerPool, conn: Arc<MockConn>) -> session::StopRequester {
        let (ticket, requester, waiter) = session::ticket(conn);
        let handoff = self.handoff.clone();
        pool.try_admit().unwrap().submit(move || handoff.attach(ticket, waiter).unwrap()).unwrap();
        requester
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[test]
fn three_frames_then_close() {
    let mut rig = StreamRig::new();
    let conn = MockConn::new(1, Duration::from_millis(0));

    let (requester, worker) = rig.open(conn.clone());
    wait_until("the session to start", || rig.status.state() == SessionState::Active);

    for _ in 0..3 {
        rig.push_frame();
    }
    wait_until("three frames to be sent", || conn.num_binary() == 3);
    wait_until("three frames to be released", || rig.pool.stats().released == 3);

    assert_eq!(requester.stop(), StopOutcome::Acknowledged);

    // Every frame came back to the pool through the send path
    let stats = rig.pool.stats();
    assert_eq!(stats.acquired, 3);
    assert_eq!(stats.released, 3);
    assert_eq!(rig.pool.outstanding(), 0);
    assert_eq!(rig.status.state(), SessionState::Idle);

    let sent = conn.binary.lock().unwrap();
    assert_eq!(sent[0], vec![1; 16]);
    assert_eq!(sent[2], vec![3; 16]);

    worker.join().unwrap();
}

#[test]
fn stop_waits_for_in_flight_send() {
    let mut rig = StreamRig::new();
    let conn = MockConn::new(1, Duration::from_millis(150));

    let (requester, worker) = rig.open(conn.clone());
    wait_until("the session to start", || rig.status.state() == SessionState::Active);

    rig.push_frame();
    wait_until("the send to start", || conn.sending.load(Ordering::SeqCst));

    // Stop while the frame is still being sent
    assert_eq!(requester.stop(), StopOutcome::Acknowledged);

    // By the time the stop is acknowledged the send completed and the frame is back
    assert!(!conn.sending.load(Ordering::SeqCst));
    assert_eq!(conn.num_binary(), 1);
    assert_eq!(rig.pool.outstanding(), 0);

    worker.join().unwrap();
}

#[test]
fn frames_queued_during_stop_are_released() {
    let mut rig = StreamRig::new();
    let conn = MockConn::new(1, Duration::from_millis(100));

    let (requester, worker) = rig.open(conn.clone());
    wait_until("the session to start", || rig.status.state() == SessionState::Active);

    rig.push_frame();
    wait_until("the send to start", || conn.sending.load(Ordering::SeqCst));
    rig.push_frame();

    assert_eq!(requester.stop(), StopOutcome::Acknowledged);

    // The second frame is either still queued or was dropped by the stop, never sent
    assert_eq!(conn.num_binary(), 1);
    let stats = rig.pool.stats();
    assert_eq!(stats.acquired, 2);
    assert_eq!(rig.pool.outstanding() as usize, rig.frame_tx.len());

    worker.join().unwrap();
}

#[test]
fn second_session_is_deferred() {
    let mut rig = StreamRig::new();
    let first = MockConn::new(1, Duration::from_millis(0));
    let second = MockConn::new(2, Duration::from_millis(0));

    let (stop_first, worker_first) = rig.open(first.clone());
    wait_until("the first session to start", || rig.status.served() == 1);

    let (stop_second, worker_second) = rig.open(second.clone());

    for _ in 0..2 {
        rig.push_frame();
    }
    wait_until("frames on the first connection", || first.num_binary() == 2);
    assert_eq!(second.num_binary(), 0);
    assert_eq!(rig.status.served(), 1);

    assert_eq!(stop_first.stop(), StopOutcome::Acknowledged);
    worker_first.join().unwrap();

    wait_until("the second session to start", || rig.status.served() == 2);
    rig.push_frame();
    wait_until("a frame on the second connection", || second.num_binary() == 1);
    assert_eq!(first.num_binary(), 2);

    assert_eq!(stop_second.stop(), StopOutcome::Acknowledged);
    worker_second.join().unwrap();
    assert_eq!(rig.pool.outstanding(), 0);
}

#[test]
fn queued_session_can_be_cancelled() {
    let rig = StreamRig::new();
    let first = MockConn::new(1, Duration::from_millis(0));
    let second = MockConn::new(2, Duration::from_millis(0));

    let (stop_first, worker_first) = rig.open(first);
    wait_until("the first session to start", || rig.status.served() == 1);

    let (stop_second, worker_second) = rig.open(second);
    assert_eq!(stop_second.stop(), StopOutcome::Cancelled);

    assert_eq!(stop_first.stop(), StopOutcome::Acknowledged);
    worker_first.join().unwrap();

    // The cancelled ticket is skipped and its worker released
    worker_second.join().unwrap();
    assert_eq!(rig.status.served(), 1);
    assert_eq!(rig.status.state(), SessionState::Idle);
}

#[test]
fn cancelled_sessions_free_their_workers() {
    let rig = StreamRig::new();
    let pool = WorkerPool::new(3, Duration::from_secs(1)).unwrap();

    let stop_active = rig.open_pooled(&pool, MockConn::new(1, Duration::from_millis(0)));
    wait_until("the first session to start", || rig.status.served() == 1);

    // One ticket waits in the handoff slot, the other on the full slot
    let stop_queued = rig.open_pooled(&pool, MockConn::new(2, Duration::from_millis(0)));
    let stop_blocked = rig.open_pooled(&pool, MockConn::new(3, Duration::from_millis(0)));
    wait_until("all workers busy", || pool.in_flight() == 3);
    assert!(pool.try_admit().is_err());

    assert_eq!(stop_blocked.stop(), StopOutcome::Cancelled);
    assert_eq!(stop_queued.stop(), StopOutcome::Cancelled);

    // Both workers go idle while the first session is still being served
    wait_until("the cancelled workers to be released", || pool.available() == 2);
    assert_eq!(pool.in_flight(), 1);
    assert_eq!(rig.status.state(), SessionState::Active);
    assert!(pool.try_admit().is_ok());

    assert_eq!(stop_active.stop(), StopOutcome::Acknowledged);
    wait_until("every worker to be released", || pool.available() == 3);
    assert_eq!(rig.status.served(), 1);
}

#[test]
fn telemetry_session_gates_the_sampler() {
    let source = CountingSource::default();
    let ctrl = SamplerCtrl::new();
    let (tm_tx, tm_rx) = channel::bounded("tm", 2).unwrap();

    sampler::spawn(source.clone(), ctrl.clone(), tm_tx, Duration::from_millis(10)).unwrap();
    let (handoff, status, _) = session::spawn(
        TelemetrySession::new(ctrl.clone()), tm_rx, Duration::from_millis(5)
    ).unwrap();

    // Nothing is sampled without a session
    thread::sleep(Duration::from_millis(50));
    assert_eq!(source.reads.load(Ordering::SeqCst), 0);

    let conn = MockConn::new(1, Duration::from_millis(0));
    let (ticket, requester, waiter) = session::ticket(conn.clone());
    let worker = thread::spawn(move || handoff.attach(ticket, waiter).unwrap());

    wait_until("three records", || conn.num_text() >= 3);
    assert_eq!(ctrl.state(), SamplerState::Sampling);

    let first = TelemetryRecord::from_json(&conn.text.lock().unwrap()[0]).unwrap();
    assert_eq!(first.rssi, Some(-60));

    assert_eq!(requester.stop(), StopOutcome::Acknowledged);
    assert_eq!(status.state(), SessionState::Idle);
    worker.join().unwrap();

    wait_until("the sampler to stop", || ctrl.state() == SamplerState::Stopped);
    let reads = source.reads.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(source.reads.load(Ordering::SeqCst), reads);
}
