//! Per-stream state.
//!
//! A [`Stream`] is one bidirectional channel multiplexed within a
//! session (RFC 7540 Section 5). It tracks its two flow control
//! windows, the close state of each half, and an idle deadline. The
//! session owns the stream registry; streams keep a weak back
//! reference so removal stays authoritative at the session.

use crate::callback::Callback;
use crate::error::ErrorCode;
use crate::frames::{DataFrame, HeadersFrame, ResetFrame};
use crate::listener::StreamListener;
use crate::scheduler::TimerHandle;
use crate::session::{Consumed, Session};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

const LOCAL_CLOSED: u8 = 0x1;
const REMOTE_CLOSED: u8 = 0x2;
const FULLY_CLOSED: u8 = LOCAL_CLOSED | REMOTE_CLOSED;

/// One HTTP/2 stream.
pub struct Stream {
    id: u32,
    local: bool,
    session: Weak<Session>,
    send_window: AtomicI32,
    recv_window: AtomicI32,
    close_bits: AtomicU8,
    reset: AtomicBool,
    listener: Mutex<Option<Arc<dyn StreamListener>>>,
    idle_timeout: Mutex<Duration>,
    last_activity: Mutex<Instant>,
    timer: Mutex<Option<TimerHandle>>,
}

impl Stream {
    pub(crate) fn new(session: Weak<Session>, id: u32, local: bool) -> Arc<Self> {
        Arc::new(Stream {
            id,
            local,
            session,
            send_window: AtomicI32::new(0),
            recv_window: AtomicI32::new(0),
            close_bits: AtomicU8::new(0),
            reset: AtomicBool::new(false),
            listener: Mutex::new(None),
            idle_timeout: Mutex::new(Duration::ZERO),
            last_activity: Mutex::new(Instant::now()),
            timer: Mutex::new(None),
        })
    }

    /// Stream id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this side initiated the stream.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// The owning session, if still alive.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    /// Current send window.
    pub fn send_window(&self) -> i32 {
        self.send_window.load(Ordering::Acquire)
    }

    /// Current receive window.
    pub fn recv_window(&self) -> i32 {
        self.recv_window.load(Ordering::Acquire)
    }

    /// Adjust the send window, returning the previous value.
    pub fn update_send_window(&self, delta: i32) -> i32 {
        self.send_window.fetch_add(delta, Ordering::AcqRel)
    }

    /// Adjust the receive window, returning the previous value.
    pub fn update_recv_window(&self, delta: i32) -> i32 {
        self.recv_window.fetch_add(delta, Ordering::AcqRel)
    }

    /// Install the application listener.
    pub fn set_listener(&self, listener: Arc<dyn StreamListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn StreamListener>> {
        self.listener.lock().unwrap().clone()
    }

    /// Record the close of one half of the stream.
    ///
    /// Returns true when this call closed the second half, i.e. the
    /// stream just became fully closed; the caller is then responsible
    /// for removing it from the session.
    pub(crate) fn update_close(&self, update: bool, local: bool) -> bool {
        if !update {
            return false;
        }
        let bit = if local { LOCAL_CLOSED } else { REMOTE_CLOSED };
        let prev = self.close_bits.fetch_or(bit, Ordering::AcqRel);
        prev != FULLY_CLOSED && (prev | bit) == FULLY_CLOSED
    }

    /// Close both halves. Returns true if the stream was not already
    /// fully closed.
    pub(crate) fn close(&self) -> bool {
        let prev = self.close_bits.fetch_or(FULLY_CLOSED, Ordering::AcqRel);
        self.cancel_idle_timer();
        prev != FULLY_CLOSED
    }

    /// Whether both halves are closed (or the stream was reset).
    pub fn is_closed(&self) -> bool {
        self.reset.load(Ordering::Acquire)
            || self.close_bits.load(Ordering::Acquire) == FULLY_CLOSED
    }

    /// Whether the local half is closed (no more frames will be sent).
    pub fn is_locally_closed(&self) -> bool {
        self.close_bits.load(Ordering::Acquire) & LOCAL_CLOSED != 0
    }

    /// Whether the remote half is closed (no more frames will arrive).
    pub fn is_remotely_closed(&self) -> bool {
        self.close_bits.load(Ordering::Acquire) & REMOTE_CLOSED != 0
    }

    /// Whether the stream was reset.
    pub fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    // --- inbound frame processing -------------------------------------

    pub(crate) fn process_headers(self: &Arc<Self>, session: &Arc<Session>, frame: &HeadersFrame) {
        self.not_idle();
        let fully = frame.end_stream && self.update_close(true, false);
        self.notify_headers(frame);
        if fully {
            session.remove_stream(self);
        }
    }

    pub(crate) fn process_data(
        self: &Arc<Self>,
        session: &Arc<Session>,
        frame: DataFrame,
        flow_control_length: usize,
    ) {
        self.not_idle();
        let fully = frame.end_stream && self.update_close(true, false);
        let consumed = Consumed::new(
            Arc::downgrade(session),
            Arc::downgrade(self),
            flow_control_length,
        );
        self.notify_data(&frame, consumed);
        if fully {
            session.remove_stream(self);
        }
    }

    pub(crate) fn process_reset(self: &Arc<Self>, session: &Arc<Session>, frame: &ResetFrame) {
        self.reset.store(true, Ordering::Release);
        self.close();
        session.remove_stream(self);
        self.notify_reset(frame);
    }

    // --- idle handling ------------------------------------------------

    /// Mark activity on this stream, pushing the idle deadline out.
    pub fn not_idle(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Arm (or disarm, with zero) the idle timeout.
    pub(crate) fn set_idle_timeout(self: &Arc<Self>, timeout: Duration) {
        *self.idle_timeout.lock().unwrap() = timeout;
        self.not_idle();
        self.cancel_idle_timer();
        if !timeout.is_zero() {
            self.schedule_idle_check(timeout);
        }
    }

    pub(crate) fn cancel_idle_timer(&self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
    }

    fn schedule_idle_check(self: &Arc<Self>, delay: Duration) {
        let Some(session) = self.session() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = session.scheduler().schedule(
            delay,
            Box::new(move || {
                if let Some(stream) = weak.upgrade() {
                    stream.check_idle();
                }
            }),
        );
        *self.timer.lock().unwrap() = Some(handle);
    }

    fn check_idle(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let timeout = *self.idle_timeout.lock().unwrap();
        if timeout.is_zero() {
            return;
        }
        let elapsed = self.last_activity.lock().unwrap().elapsed();
        if elapsed < timeout {
            // Activity moved the deadline; check again when it is due.
            self.schedule_idle_check(timeout - elapsed);
            return;
        }
        self.on_idle_expired();
    }

    fn on_idle_expired(self: &Arc<Self>) {
        tracing::debug!(stream_id = self.id, "stream idle timeout expired");
        if self.notify_idle_timeout() {
            if let Some(session) = self.session() {
                session.reset(
                    ResetFrame::new(self.id, ErrorCode::Cancel),
                    Callback::noop(),
                );
            }
        } else {
            self.not_idle();
            let timeout = *self.idle_timeout.lock().unwrap();
            if !timeout.is_zero() {
                self.schedule_idle_check(timeout);
            }
        }
    }

    // --- listener notification ----------------------------------------
    //
    // Application code must not take the engine down: panics are caught
    // and logged.

    fn notify_headers(self: &Arc<Self>, frame: &HeadersFrame) {
        if let Some(listener) = self.listener() {
            if catch_unwind(AssertUnwindSafe(|| listener.on_headers(self, frame))).is_err() {
                tracing::warn!(stream_id = self.id, "stream listener panicked in on_headers");
            }
        }
    }

    fn notify_data(self: &Arc<Self>, frame: &DataFrame, consumed: Consumed) {
        match self.listener() {
            Some(listener) => {
                if catch_unwind(AssertUnwindSafe(|| listener.on_data(self, frame, consumed)))
                    .is_err()
                {
                    tracing::warn!(stream_id = self.id, "stream listener panicked in on_data");
                }
            }
            // No listener: consume immediately so the windows recover.
            None => consumed.complete(),
        }
    }

    fn notify_reset(self: &Arc<Self>, frame: &ResetFrame) {
        if let Some(listener) = self.listener() {
            if catch_unwind(AssertUnwindSafe(|| listener.on_reset(self, frame))).is_err() {
                tracing::warn!(stream_id = self.id, "stream listener panicked in on_reset");
            }
        }
    }

    fn notify_idle_timeout(self: &Arc<Self>) -> bool {
        match self.listener() {
            Some(listener) => {
                catch_unwind(AssertUnwindSafe(|| listener.on_idle_timeout(self)))
                    .unwrap_or(true)
            }
            None => true,
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("send_window", &self.send_window())
            .field("recv_window", &self.recv_window())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orphan_stream(id: u32, local: bool) -> Arc<Stream> {
        Stream::new(Weak::new(), id, local)
    }

    #[test]
    fn test_close_halves() {
        let stream = orphan_stream(1, true);
        assert!(!stream.is_closed());

        assert!(!stream.update_close(true, true));
        assert!(stream.is_locally_closed());
        assert!(!stream.is_closed());

        // Closing the second half reports full closure exactly once.
        assert!(stream.update_close(true, false));
        assert!(stream.is_closed());
        assert!(!stream.update_close(true, false));
    }

    #[test]
    fn test_update_close_without_update_is_noop() {
        let stream = orphan_stream(1, true);
        assert!(!stream.update_close(false, true));
        assert!(!stream.is_locally_closed());
    }

    #[test]
    fn test_window_arithmetic() {
        let stream = orphan_stream(3, false);
        assert_eq!(stream.update_send_window(65535), 0);
        assert_eq!(stream.send_window(), 65535);
        assert_eq!(stream.update_send_window(-1000), 65535);
        assert_eq!(stream.send_window(), 64535);

        stream.update_recv_window(65535);
        stream.update_recv_window(-110);
        assert_eq!(stream.recv_window(), 65425);
    }

    #[test]
    fn test_close_is_idempotent() {
        let stream = orphan_stream(5, true);
        assert!(stream.close());
        assert!(!stream.close());
        assert!(stream.is_closed());
    }
}
