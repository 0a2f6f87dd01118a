//! Shared test fixtures: an in-memory endpoint that records the exact
//! byte stream the flusher writes, and helpers to decode it back into
//! frames.
#![allow(dead_code)]

use h2mux::codec::{FrameSink, Parser};
use h2mux::endpoint::Endpoint;
use h2mux::frames::Frame;
use h2mux::ErrorCode;
use std::cell::RefCell;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct MockState {
    written: Vec<u8>,
    writes_started: usize,
    block_writes: bool,
    fail_writes: bool,
    output_shutdown: bool,
    closed: bool,
}

/// In-memory [`Endpoint`] recording everything the session writes.
pub struct MockEndpoint {
    state: Mutex<MockState>,
    cond: Condvar,
    idle_timeout: Duration,
}

impl MockEndpoint {
    pub fn new() -> Arc<Self> {
        Self::with_idle_timeout(Duration::from_secs(30))
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Arc<Self> {
        init_logging();
        Arc::new(MockEndpoint {
            state: Mutex::new(MockState::default()),
            cond: Condvar::new(),
            idle_timeout,
        })
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    /// Decode everything written so far. Always replays from the first
    /// byte so the HPACK dynamic table stays in sync.
    pub fn frames(&self) -> Vec<Frame> {
        let bytes = self.written();
        let collector = Collector::default();
        let mut parser = Parser::new();
        // The session's own writes may use a max frame size the peer
        // raised via SETTINGS; that negotiation isn't visible in the
        // outbound byte stream, so decode with the largest frame size
        // the wire format allows rather than the protocol default.
        parser.set_max_frame_size(h2mux::MAX_FRAME_SIZE_LIMIT);
        parser.parse(&bytes, &collector);
        collector.frames.into_inner()
    }

    pub fn output_shutdown(&self) -> bool {
        self.state.lock().unwrap().output_shutdown
    }

    pub fn closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Make writes park until unblocked, so a backlog can be built
    /// deterministically.
    pub fn set_block_writes(&self, block: bool) {
        let mut state = self.state.lock().unwrap();
        state.block_writes = block;
        self.cond.notify_all();
    }

    /// Make subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    /// Wait until at least `count` transport writes have begun.
    pub fn wait_writes_started(&self, count: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.writes_started < count {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for a transport write to start");
            let (guard, _) = self.cond.wait_timeout(state, remaining).unwrap();
            state = guard;
        }
    }
}

impl Endpoint for MockEndpoint {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.writes_started += 1;
        self.cond.notify_all();
        while state.block_writes {
            state = self.cond.wait(state).unwrap();
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock failure"));
        }
        state.written.extend_from_slice(buf);
        self.cond.notify_all();
        Ok(())
    }

    fn shutdown_output(&self) -> io::Result<()> {
        self.state.lock().unwrap().output_shutdown = true;
        self.cond.notify_all();
        Ok(())
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }

    fn is_open(&self) -> bool {
        !self.state.lock().unwrap().closed
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

#[derive(Default)]
pub struct Collector {
    pub frames: RefCell<Vec<Frame>>,
    pub connection_failures: RefCell<Vec<(ErrorCode, String)>>,
}

impl FrameSink for Collector {
    fn on_frame(&self, frame: Frame) {
        self.frames.borrow_mut().push(frame);
    }

    fn on_connection_failure(&self, code: ErrorCode, reason: &str) {
        self.connection_failures
            .borrow_mut()
            .push((code, reason.to_string()));
    }

    fn on_stream_failure(&self, _stream_id: u32, code: ErrorCode, reason: &str) {
        self.connection_failures
            .borrow_mut()
            .push((code, reason.to_string()));
    }
}

/// Route engine tracing to the test output when RUST_LOG is set.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until `predicate` holds, panicking after `timeout`.
pub fn wait_until<F: Fn() -> bool>(predicate: F, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Poll until the endpoint has written at least `count` frames, then
/// return them.
pub fn wait_frames(endpoint: &Arc<MockEndpoint>, count: usize, what: &str) -> Vec<Frame> {
    wait_until(
        || endpoint.frames().len() >= count,
        Duration::from_secs(5),
        what,
    );
    endpoint.frames()
}
