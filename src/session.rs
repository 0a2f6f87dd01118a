//! The HTTP/2 session: one instance per connection.
//!
//! The session owns the stream registry, the session-level flow
//! control windows, the close state machine and the flusher. Decoded
//! frames arrive through [`crate::codec::FrameSink`]; the outbound API
//! ([`Session::new_stream`], [`Session::data`], [`Session::ping`],
//! [`Session::close`], ...) enqueues entries on the flusher from any
//! thread.

use crate::callback::{self, Callback};
use crate::codec::{FrameSink, Generator};
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorCode};
use crate::flow_control::{FlowControl, SimpleFlowControl};
use crate::flusher::{Entry, Flusher};
use crate::frames::*;
use crate::listener::{ClientPolicy, ServerPolicy, SessionListener, StreamListener, StreamPolicy};
use crate::scheduler::{Scheduler, ThreadScheduler};
use crate::stream::Stream;
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Close state of the session.
///
/// Transitions are monotone: NotClosed -> {LocallyClosed,
/// RemotelyClosed} -> Closed, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseState {
    /// Fully open.
    NotClosed = 0,
    /// We sent a GOAWAY; output shuts down after it is flushed, reads
    /// continue until the peer closes.
    LocallyClosed = 1,
    /// We received a GOAWAY; the queue drains, then the connection
    /// closes.
    RemotelyClosed = 2,
    /// Terminated: no streams, no flusher, transport closed.
    Closed = 3,
}

impl CloseState {
    fn from_u8(value: u8) -> CloseState {
        match value {
            0 => CloseState::NotClosed,
            1 => CloseState::LocallyClosed,
            2 => CloseState::RemotelyClosed,
            _ => CloseState::Closed,
        }
    }
}

/// Completion handle for inbound DATA: the application calls
/// [`Consumed::complete`] once the bytes are consumed, replenishing
/// the session and stream receive windows.
pub struct Consumed {
    session: Weak<Session>,
    stream: Weak<Stream>,
    length: usize,
}

impl Consumed {
    pub(crate) fn new(session: Weak<Session>, stream: Weak<Stream>, length: usize) -> Self {
        Consumed {
            session,
            stream,
            length,
        }
    }

    /// The bytes were consumed: refund the flow control windows.
    pub fn complete(self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        session.not_idle();
        let stream = self.stream.upgrade();
        if let Some(stream) = &stream {
            stream.not_idle();
        }
        session
            .flow_control
            .on_data_consumed(&session, stream.as_ref(), self.length);
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    listener: Arc<dyn SessionListener>,
    policy: Arc<dyn StreamPolicy>,
    flow_control: Arc<dyn FlowControl>,
    scheduler: Option<Arc<dyn Scheduler>>,
    initial_stream_id: u32,
    max_local_streams: i32,
    max_remote_streams: i32,
    stream_idle_timeout: Option<Duration>,
}

impl SessionBuilder {
    /// A client session: local stream ids are odd, starting at 1.
    pub fn client() -> Self {
        Self::with_role(Arc::new(ClientPolicy), 1)
    }

    /// A server session: local stream ids are even, starting at 2.
    pub fn server() -> Self {
        Self::with_role(Arc::new(ServerPolicy), 2)
    }

    fn with_role(policy: Arc<dyn StreamPolicy>, initial_stream_id: u32) -> Self {
        SessionBuilder {
            listener: Arc::new(()),
            policy,
            flow_control: Arc::new(SimpleFlowControl::new()),
            scheduler: None,
            initial_stream_id,
            max_local_streams: -1,
            max_remote_streams: -1,
            stream_idle_timeout: None,
        }
    }

    /// Install the session listener.
    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Replace the flow control strategy.
    pub fn flow_control(mut self, flow_control: Arc<dyn FlowControl>) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Replace the header-processing policy.
    pub fn policy(mut self, policy: Arc<dyn StreamPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Use an external timer scheduler.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Cap on streams this side may open; negative means unbounded.
    pub fn max_local_streams(mut self, max: i32) -> Self {
        self.max_local_streams = max;
        self
    }

    /// Cap on streams the peer may open; negative means unbounded.
    pub fn max_remote_streams(mut self, max: i32) -> Self {
        self.max_remote_streams = max;
        self
    }

    /// Idle timeout for new streams; zero disables.
    pub fn stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = Some(timeout);
        self
    }

    /// Build the session over `endpoint` and start its flusher.
    pub fn build(self, endpoint: Arc<dyn Endpoint>) -> Arc<Session> {
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => ThreadScheduler::new(),
        };
        let stream_idle_timeout = self
            .stream_idle_timeout
            .unwrap_or_else(|| endpoint.idle_timeout());

        Arc::new_cyclic(|weak: &Weak<Session>| {
            let flusher = Flusher::new();
            flusher.spawn(weak.clone());
            Session {
                streams: DashMap::new(),
                next_stream_id: AtomicU32::new(self.initial_stream_id),
                last_remote_stream_id: AtomicU32::new(0),
                local_stream_count: AtomicI32::new(0),
                remote_stream_count: AtomicI32::new(0),
                max_local_streams: AtomicI32::new(self.max_local_streams),
                max_remote_streams: AtomicI32::new(self.max_remote_streams),
                send_window: AtomicI32::new(crate::DEFAULT_INITIAL_WINDOW_SIZE as i32),
                recv_window: AtomicI32::new(crate::DEFAULT_INITIAL_WINDOW_SIZE as i32),
                close_state: AtomicU8::new(CloseState::NotClosed as u8),
                bytes_written: AtomicU64::new(0),
                // RFC 7540: push is enabled by default.
                push_enabled: AtomicBool::new(true),
                stream_idle_timeout: Mutex::new(stream_idle_timeout),
                last_activity: Mutex::new(Instant::now()),
                stream_alloc: Mutex::new(()),
                listener: self.listener,
                policy: self.policy,
                flow_control: self.flow_control,
                scheduler,
                endpoint,
                generator: Arc::new(Generator::new()),
                flusher,
            }
        })
    }
}

/// One HTTP/2 connection.
pub struct Session {
    streams: DashMap<u32, Arc<Stream>>,
    next_stream_id: AtomicU32,
    last_remote_stream_id: AtomicU32,
    local_stream_count: AtomicI32,
    remote_stream_count: AtomicI32,
    max_local_streams: AtomicI32,
    max_remote_streams: AtomicI32,
    send_window: AtomicI32,
    recv_window: AtomicI32,
    close_state: AtomicU8,
    bytes_written: AtomicU64,
    push_enabled: AtomicBool,
    stream_idle_timeout: Mutex<Duration>,
    last_activity: Mutex<Instant>,
    // Held across stream-id allocation and the enqueue of the opening
    // frame, so wire order matches id order (RFC 7540 Section 5.1.1).
    stream_alloc: Mutex<()>,
    listener: Arc<dyn SessionListener>,
    policy: Arc<dyn StreamPolicy>,
    flow_control: Arc<dyn FlowControl>,
    scheduler: Arc<dyn Scheduler>,
    endpoint: Arc<dyn Endpoint>,
    generator: Arc<Generator>,
    flusher: Flusher,
}

impl Session {
    // --- accessors ----------------------------------------------------

    /// Session-level send window.
    pub fn send_window(&self) -> i32 {
        self.send_window.load(Ordering::Acquire)
    }

    /// Session-level receive window.
    pub fn recv_window(&self) -> i32 {
        self.recv_window.load(Ordering::Acquire)
    }

    /// Adjust the send window, returning the previous value.
    pub(crate) fn update_send_window(&self, delta: i32) -> i32 {
        self.send_window.fetch_add(delta, Ordering::AcqRel)
    }

    /// Adjust the receive window, returning the previous value.
    pub(crate) fn update_recv_window(&self, delta: i32) -> i32 {
        self.recv_window.fetch_add(delta, Ordering::AcqRel)
    }

    /// Total bytes handed to the transport.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub(crate) fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Current close state.
    pub fn close_state(&self) -> CloseState {
        CloseState::from_u8(self.close_state.load(Ordering::Acquire))
    }

    /// Whether the session left the fully-open state.
    pub fn is_closed(&self) -> bool {
        self.close_state() != CloseState::NotClosed
    }

    /// Whether the peer allows this side to push.
    pub fn is_push_enabled(&self) -> bool {
        self.push_enabled.load(Ordering::Acquire)
    }

    /// Highest stream id observed from the peer.
    pub fn last_remote_stream_id(&self) -> u32 {
        self.last_remote_stream_id.load(Ordering::Acquire)
    }

    /// Cap on streams this side may open (negative = unbounded).
    pub fn max_local_streams(&self) -> i32 {
        self.max_local_streams.load(Ordering::Acquire)
    }

    /// Cap on streams the peer may open (negative = unbounded).
    pub fn max_remote_streams(&self) -> i32 {
        self.max_remote_streams.load(Ordering::Acquire)
    }

    pub fn set_max_remote_streams(&self, max: i32) {
        self.max_remote_streams.store(max, Ordering::Release);
    }

    /// Idle timeout applied to new streams.
    pub fn stream_idle_timeout(&self) -> Duration {
        *self.stream_idle_timeout.lock().unwrap()
    }

    pub fn set_stream_idle_timeout(&self, timeout: Duration) {
        *self.stream_idle_timeout.lock().unwrap() = timeout;
    }

    /// Look up a stream by id.
    pub fn stream(&self, stream_id: u32) -> Option<Arc<Stream>> {
        self.streams.get(&stream_id).map(|s| s.value().clone())
    }

    /// Snapshot of the active streams.
    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams.iter().map(|s| s.value().clone()).collect()
    }

    /// Number of active streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn flow_control(&self) -> &Arc<dyn FlowControl> {
        &self.flow_control
    }

    pub(crate) fn generator(&self) -> &Arc<Generator> {
        &self.generator
    }

    pub(crate) fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Mark session activity, pushing the idle deadline out.
    pub fn not_idle(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Write raw bytes to the transport ahead of any queued frame.
    /// Meant for the client connection preface (RFC 7540 Section 3.5),
    /// which precedes every frame.
    pub fn endpoint_write(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.endpoint.write(bytes)
    }

    // --- inbound frame handling ---------------------------------------

    /// Entry point for every decoded frame.
    pub fn on_frame(self: &Arc<Self>, frame: Frame) {
        tracing::trace!(frame = %frame, "received");
        self.not_idle();
        match frame {
            Frame::Data(f) => self.on_data(f),
            Frame::Headers(f) => self.policy.on_headers(self, f),
            Frame::Priority(f) => self.on_priority(f),
            Frame::Reset(f) => self.on_reset(f),
            Frame::Settings(f) => self.on_settings(f, true),
            Frame::PushPromise(f) => self.policy.on_push_promise(self, f),
            Frame::Ping(f) => self.on_ping(f),
            Frame::GoAway(f) => self.on_go_away(f),
            Frame::WindowUpdate(f) => self.on_window_update(f),
            Frame::Unknown(frame_type) => {
                tracing::debug!(frame_type, "unknown frame at top level");
                self.on_connection_failure(ErrorCode::ProtocolError, "unknown_frame_type");
            }
            Frame::Disconnect => {}
        }
    }

    fn on_data(self: &Arc<Self>, frame: DataFrame) {
        let stream = self.stream(frame.stream_id);

        // RFC 7540 Section 6.9: the session window must be updated even
        // if the stream is gone. The flow control length includes the
        // padding bytes.
        let flow_control_length = frame.flow_control_length();
        self.flow_control
            .on_data_received(self, stream.as_ref(), flow_control_length);

        match stream {
            Some(stream) => {
                if self.recv_window() < 0 {
                    self.close(
                        ErrorCode::FlowControlError,
                        "session_window_exceeded",
                        Callback::noop(),
                    );
                } else if stream.is_remotely_closed() {
                    // Data past END_STREAM; refund and reset.
                    self.flow_control
                        .on_data_consumed(self, Some(&stream), flow_control_length);
                    self.reset(
                        ResetFrame::new(stream.id(), ErrorCode::StreamClosed),
                        Callback::noop(),
                    );
                } else {
                    stream.process_data(self, frame, flow_control_length);
                }
            }
            None => {
                tracing::debug!(stream_id = frame.stream_id, "ignoring DATA, stream not found");
                // We must enlarge the session flow control window,
                // otherwise other requests will be stalled.
                self.flow_control
                    .on_data_consumed(self, None, flow_control_length);
            }
        }
    }

    fn on_priority(&self, frame: PriorityFrame) {
        tracing::trace!(stream_id = frame.stream_id, "received PRIORITY");
    }

    fn on_reset(self: &Arc<Self>, frame: ResetFrame) {
        match self.stream(frame.stream_id) {
            Some(stream) => stream.process_reset(self, &frame),
            None => self.notify_reset(&frame),
        }
    }

    /// Apply a SETTINGS frame; `reply` controls whether an empty ACK
    /// is queued afterwards (RFC 7540: SETTINGS must be replied).
    pub fn on_settings(self: &Arc<Self>, frame: SettingsFrame, reply: bool) {
        if frame.ack {
            return;
        }
        let settings = &frame.settings;

        if let Some(value) = settings.header_table_size {
            tracing::debug!(value, "update HPACK header table size");
            self.generator.set_header_table_size(value);
        }
        if let Some(value) = settings.enable_push {
            // RFC 7540 Section 6.5.2: the value must be 0 or 1.
            if value > 1 {
                self.on_connection_failure(
                    ErrorCode::ProtocolError,
                    "invalid_settings_enable_push",
                );
                return;
            }
            self.push_enabled.store(value == 1, Ordering::Release);
        }
        if let Some(value) = settings.max_concurrent_streams {
            tracing::debug!(value, "update max local concurrent streams");
            self.max_local_streams
                .store(value.min(i32::MAX as u32) as i32, Ordering::Release);
        }
        if let Some(value) = settings.initial_window_size {
            if value > 0x7FFF_FFFF {
                self.on_connection_failure(
                    ErrorCode::FlowControlError,
                    "invalid_settings_initial_window_size",
                );
                return;
            }
            tracing::debug!(value, "update initial stream window size");
            if let Err(e) = self
                .flow_control
                .update_initial_stream_window(self, value, false)
            {
                tracing::debug!(error = %e, "stream window overflow applying settings");
                self.on_connection_failure(ErrorCode::FlowControlError, "stream_window_overflow");
                return;
            }
            // Streams parked on an exhausted window may now proceed.
            self.flusher.unstall();
        }
        if let Some(value) = settings.max_frame_size {
            // RFC 7540 Section 6.5.2: the value must stay in range.
            if !(crate::DEFAULT_MAX_FRAME_SIZE..=crate::MAX_FRAME_SIZE_LIMIT).contains(&value) {
                self.on_connection_failure(
                    ErrorCode::ProtocolError,
                    "invalid_settings_max_frame_size",
                );
                return;
            }
            tracing::debug!(value, "update max frame size");
            self.generator.set_max_frame_size(value);
        }
        if let Some(value) = settings.max_header_list_size {
            tracing::debug!(value, "update max header list size");
            self.generator.set_max_header_list_size(value as usize);
        }

        self.notify_settings(&frame);

        if reply {
            self.settings(SettingsFrame::ack(), Callback::noop());
        }
    }

    fn on_ping(self: &Arc<Self>, frame: PingFrame) {
        if frame.ack {
            self.notify_ping(&frame);
        } else {
            let reply = PingFrame::ack(frame.data);
            self.control(None, Frame::Ping(reply), Callback::noop());
        }
    }

    /// GOAWAY from the peer: on the first one we move to
    /// RemotelyClosed and queue a DISCONNECT, so the queue content is
    /// written and then the connection closed. Later GOAWAYs (or one
    /// racing another close path) are ignored; the winner's side
    /// effect stands.
    fn on_go_away(self: &Arc<Self>, frame: GoAwayFrame) {
        loop {
            let current = self.close_state();
            match current {
                CloseState::NotClosed => {
                    if self.cas_close_state(current, CloseState::RemotelyClosed) {
                        self.notify_close(&frame);
                        self.control(None, Frame::Disconnect, Callback::noop());
                        return;
                    }
                }
                _ => {
                    tracing::debug!(state = ?current, "ignored GOAWAY, already closed");
                    return;
                }
            }
        }
    }

    /// Inbound WINDOW_UPDATE frames are never applied here: the
    /// flusher reads both windows when slicing DATA, so it alone
    /// mutates them. The update is queued and applied atomically with
    /// the next flush decision.
    fn on_window_update(self: &Arc<Self>, frame: WindowUpdateFrame) {
        if frame.stream_id > 0 {
            match self.stream(frame.stream_id) {
                Some(stream) => {
                    stream.not_idle();
                    self.flusher.window(Some(stream), frame);
                }
                None => {
                    tracing::debug!(
                        stream_id = frame.stream_id,
                        "ignoring WINDOW_UPDATE, stream not found"
                    );
                }
            }
        } else {
            self.flusher.window(None, frame);
        }
    }

    /// Connection-level protocol violation: notify and close.
    pub fn on_connection_failure(self: &Arc<Self>, code: ErrorCode, reason: &str) {
        self.notify_failure(&Error::Protocol(format!("{}/{}", code.as_u32(), reason)));
        self.close(code, reason, Callback::noop());
    }

    /// Stream-level protocol violation: reset the stream.
    pub fn on_stream_failure(self: &Arc<Self>, stream_id: u32, code: ErrorCode, reason: &str) {
        tracing::debug!(stream_id, code = %code, reason, "stream failure");
        self.reset(ResetFrame::new(stream_id, code), Callback::noop());
    }

    // --- outbound API -------------------------------------------------

    /// Open a local stream: atomically assign the next stream id (when
    /// the frame does not carry one), insert the stream and enqueue
    /// its HEADERS, so wire order matches id order. `callback`
    /// completes when the HEADERS frame has been written.
    pub fn new_stream(
        self: &Arc<Self>,
        frame: HeadersFrame,
        listener: Arc<dyn StreamListener>,
        callback: Callback,
    ) -> crate::error::Result<Arc<Stream>> {
        let guard = self.stream_alloc.lock().unwrap();
        let frame = if frame.stream_id == 0 {
            let stream_id = self.next_stream_id.fetch_add(2, Ordering::AcqRel);
            frame.with_stream_id(stream_id)
        } else {
            frame
        };
        let stream = match self.create_local_stream(frame.stream_id) {
            Ok(stream) => stream,
            Err(e) => {
                drop(guard);
                callback.failed(e.clone());
                return Err(e);
            }
        };
        stream.set_listener(listener);
        let queued = self
            .flusher
            .append(Entry::control(Frame::Headers(frame), Some(stream.clone()), callback));
        drop(guard);
        if queued {
            stream.not_idle();
            self.flusher.iterate();
        }
        Ok(stream)
    }

    /// Promise a pushed stream: same atomic allocate-and-enqueue as
    /// [`Session::new_stream`], on the promised id.
    pub fn push(
        self: &Arc<Self>,
        frame: PushPromiseFrame,
        listener: Arc<dyn StreamListener>,
        callback: Callback,
    ) -> crate::error::Result<Arc<Stream>> {
        let guard = self.stream_alloc.lock().unwrap();
        let frame = if frame.promised_stream_id == 0 {
            let promised = self.next_stream_id.fetch_add(2, Ordering::AcqRel);
            frame.with_promised_stream_id(promised)
        } else {
            frame
        };
        let stream = match self.create_local_stream(frame.promised_stream_id) {
            Ok(stream) => stream,
            Err(e) => {
                drop(guard);
                callback.failed(e.clone());
                return Err(e);
            }
        };
        stream.set_listener(listener);
        let queued = self.flusher.append(Entry::control(
            Frame::PushPromise(frame),
            Some(stream.clone()),
            callback,
        ));
        drop(guard);
        if queued {
            stream.not_idle();
            self.flusher.iterate();
        }
        Ok(stream)
    }

    /// Send a PRIORITY frame. A priority for an unknown stream opens
    /// it implicitly: the next local id is allocated and returned.
    pub fn priority(self: &Arc<Self>, frame: PriorityFrame, callback: Callback) -> u32 {
        match self.stream(frame.stream_id) {
            Some(stream) => {
                let stream_id = frame.stream_id;
                self.frame_entry(Entry::control(Frame::Priority(frame), Some(stream), callback));
                stream_id
            }
            None => {
                let guard = self.stream_alloc.lock().unwrap();
                let stream_id = self.next_stream_id.fetch_add(2, Ordering::AcqRel);
                let frame = PriorityFrame::new(stream_id, frame.priority);
                let queued = self
                    .flusher
                    .append(Entry::control(Frame::Priority(frame), None, callback));
                drop(guard);
                if queued {
                    self.flusher.iterate();
                }
                stream_id
            }
        }
    }

    /// Send HEADERS (a response, or trailers) on an existing stream.
    pub fn headers(self: &Arc<Self>, stream: &Arc<Stream>, frame: HeadersFrame, callback: Callback) {
        if stream.is_closed() || stream.is_locally_closed() {
            callback.failed(Error::StreamClosed(stream.id()));
            return;
        }
        self.control(Some(stream.clone()), Frame::Headers(frame), callback);
    }

    /// Send DATA on a stream. The frame is sliced to the flow control
    /// windows by the flusher; `callback` completes when the last
    /// slice has been written.
    pub fn data(self: &Arc<Self>, stream: &Arc<Stream>, frame: DataFrame, callback: Callback) {
        if stream.is_closed() || stream.is_locally_closed() {
            callback.failed(Error::StreamClosed(stream.id()));
            return;
        }
        self.frame_entry(Entry::data(stream.clone(), frame, callback));
    }

    /// Send a SETTINGS frame.
    pub fn settings(self: &Arc<Self>, frame: SettingsFrame, callback: Callback) {
        self.control(None, Frame::Settings(frame), callback);
    }

    /// Send a PING. User-submitted replies are rejected; replies are
    /// generated by the engine.
    pub fn ping(self: &Arc<Self>, frame: PingFrame, callback: Callback) {
        if frame.ack {
            callback.failed(Error::Protocol("user ping must not carry the ack flag".into()));
        } else {
            self.control(None, Frame::Ping(frame), callback);
        }
    }

    /// Reset a stream.
    pub(crate) fn reset(self: &Arc<Self>, frame: ResetFrame, callback: Callback) {
        let stream = self.stream(frame.stream_id);
        self.control(stream, Frame::Reset(frame), callback);
    }

    /// Submit several frames, completing `callback` after the last one
    /// is written.
    pub fn frames(
        self: &Arc<Self>,
        stream: Option<&Arc<Stream>>,
        frames: Vec<Frame>,
        callback: Callback,
    ) {
        if frames.is_empty() {
            callback.succeeded();
            return;
        }
        // Preserve submission order; only the last append wakes the
        // writer, and only the last completion fires the callback.
        let count = frames.len();
        let mut parts = callback::counting(callback, count);
        for (index, frame) in frames.into_iter().enumerate() {
            let part = parts.remove(0);
            let entry = Entry::control(frame, stream.cloned(), part);
            if index + 1 == count {
                self.frame_entry(entry);
            } else {
                self.enqueue_only(entry);
            }
        }
    }

    /// Graceful shutdown: on the first call we move to LocallyClosed
    /// and queue a GOAWAY carrying the highest remote stream id and
    /// the (truncated) reason. When the GOAWAY is written the flusher
    /// shuts down the output only, so frames from the peer can still
    /// be read; the connection closes when the peer does, or when the
    /// idle timeout escalates. Returns false (and succeeds the
    /// callback) if the session already left NotClosed.
    pub fn close(self: &Arc<Self>, error: ErrorCode, reason: &str, callback: Callback) -> bool {
        loop {
            let current = self.close_state();
            match current {
                CloseState::NotClosed => {
                    if self.cas_close_state(current, CloseState::LocallyClosed) {
                        let frame = GoAwayFrame::with_reason(
                            self.last_remote_stream_id(),
                            error,
                            reason,
                        );
                        self.control(None, Frame::GoAway(frame), callback);
                        return true;
                    }
                }
                _ => {
                    tracing::debug!(code = %error, reason, "ignoring close, already closed");
                    callback.succeeded();
                    return false;
                }
            }
        }
    }

    fn control(self: &Arc<Self>, stream: Option<Arc<Stream>>, frame: Frame, callback: Callback) {
        self.frame_entry(Entry::control(frame, stream, callback));
    }

    fn frame_entry(self: &Arc<Self>, entry: Entry) {
        // Ping frames are prepended to process them as soon as possible.
        let queued = if entry.is_ping() {
            self.flusher.prepend(entry)
        } else {
            self.flusher.append(entry)
        };
        if queued {
            self.flusher.iterate();
        }
    }

    fn enqueue_only(self: &Arc<Self>, entry: Entry) {
        let _ = self.flusher.append(entry);
    }

    /// Queue the WINDOW_UPDATE frames produced by the flow control
    /// strategy. Stream-level frames keep their stream reference so
    /// the post-write credit lands on the right window.
    pub(crate) fn enqueue_window_updates(
        self: &Arc<Self>,
        stream: Option<&Arc<Stream>>,
        frames: Vec<WindowUpdateFrame>,
    ) {
        let count = frames.len();
        for (index, frame) in frames.into_iter().enumerate() {
            let entry_stream = if frame.stream_id == 0 {
                None
            } else {
                stream.cloned()
            };
            let entry = Entry::control(Frame::WindowUpdate(frame), entry_stream, Callback::noop());
            if index + 1 == count {
                self.frame_entry(entry);
            } else {
                self.enqueue_only(entry);
            }
        }
    }

    // --- stream registry ----------------------------------------------

    fn create_local_stream(self: &Arc<Self>, stream_id: u32) -> crate::error::Result<Arc<Stream>> {
        loop {
            let count = self.local_stream_count.load(Ordering::Acquire);
            let max = self.max_local_streams();
            if max >= 0 && count >= max {
                return Err(Error::TooManyStreams);
            }
            if self
                .local_stream_count
                .compare_exchange(count, count + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let stream = Stream::new(Arc::downgrade(self), stream_id, true);
        match self.streams.entry(stream_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.local_stream_count.fetch_sub(1, Ordering::AcqRel);
                Err(Error::DuplicateStream(stream_id))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(stream.clone());
                stream.set_idle_timeout(self.stream_idle_timeout());
                self.flow_control.on_stream_created(&stream);
                tracing::debug!(stream_id, "created local stream");
                Ok(stream)
            }
        }
    }

    /// Create a stream opened by the peer. Returns None (after the
    /// appropriate error reaction) when the stream must not be
    /// created: id not increasing, cap exceeded, or duplicate.
    pub(crate) fn create_remote_stream(self: &Arc<Self>, stream_id: u32) -> Option<Arc<Stream>> {
        // RFC 7540 Section 5.1.1: stream ids from the peer must strictly
        // increase; a reused id is a connection error.
        if stream_id <= self.last_remote_stream_id() {
            self.close(ErrorCode::ProtocolError, "duplicate_stream", Callback::noop());
            return None;
        }

        // RFC 7540 Section 5.1.2: exceeding max concurrent streams is a
        // stream error.
        loop {
            let count = self.remote_stream_count.load(Ordering::Acquire);
            let max = self.max_remote_streams();
            if max >= 0 && count >= max {
                self.reset(
                    ResetFrame::new(stream_id, ErrorCode::RefusedStream),
                    Callback::noop(),
                );
                return None;
            }
            if self
                .remote_stream_count
                .compare_exchange(count, count + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let stream = Stream::new(Arc::downgrade(self), stream_id, false);
        match self.streams.entry(stream_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.remote_stream_count.fetch_sub(1, Ordering::AcqRel);
                self.close(ErrorCode::ProtocolError, "duplicate_stream", Callback::noop());
                None
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(stream.clone());
                self.last_remote_stream_id
                    .fetch_max(stream_id, Ordering::AcqRel);
                stream.set_idle_timeout(self.stream_idle_timeout());
                self.flow_control.on_stream_created(&stream);
                tracing::debug!(stream_id, "created remote stream");
                Some(stream)
            }
        }
    }

    /// Remove a stream: registry removal and counter decrement are
    /// atomic together (the map entry is the source of truth).
    pub(crate) fn remove_stream(self: &Arc<Self>, stream: &Arc<Stream>) {
        if let Some((_, removed)) = self.streams.remove(&stream.id()) {
            debug_assert!(Arc::ptr_eq(&removed, stream));
            if stream.is_local() {
                self.local_stream_count.fetch_sub(1, Ordering::AcqRel);
            } else {
                self.remote_stream_count.fetch_sub(1, Ordering::AcqRel);
            }
            stream.cancel_idle_timer();
            self.flow_control.on_stream_destroyed(stream);
            // Parked data for this stream, if any, must fail promptly.
            self.flusher.unstall();
            tracing::debug!(stream_id = stream.id(), local = stream.is_local(), "removed stream");
        }
    }

    pub(crate) fn on_stream_opened(&self, stream: &Arc<Stream>) {
        tracing::trace!(stream_id = stream.id(), "stream opened");
    }

    // --- close state machine ------------------------------------------

    fn cas_close_state(&self, from: CloseState, to: CloseState) -> bool {
        self.close_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The transport read side reached EOF (or failed). A typical
    /// remote close is GOAWAY then FIN:
    /// - NotClosed: the peer did not send a GOAWAY, abrupt close;
    ///   terminate.
    /// - LocallyClosed: our GOAWAY shut down only the output; queue a
    ///   DISCONNECT to finish closing.
    /// - RemotelyClosed: the pending DISCONNECT from the GOAWAY will
    ///   close; nothing to do.
    pub fn on_shutdown(self: &Arc<Self>) {
        tracing::debug!(state = ?self.close_state(), "transport shutdown");
        match self.close_state() {
            CloseState::NotClosed => {
                self.abort(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
            CloseState::LocallyClosed => {
                self.control(None, Frame::Disconnect, Callback::noop());
            }
            CloseState::RemotelyClosed | CloseState::Closed => {}
        }
    }

    /// The session idle timeout expired.
    ///
    /// - NotClosed: a real idle timeout; consult the listener and
    ///   initiate a graceful close. Returns whether a close started.
    /// - LocallyClosed / RemotelyClosed: the shutdown handshake never
    ///   finished (lost FIN, stuck queue); escalate to an abort.
    pub fn on_idle_timeout(self: &Arc<Self>) -> bool {
        match self.close_state() {
            CloseState::NotClosed => {
                let timeout = self.endpoint.idle_timeout();
                let elapsed = self.last_activity.lock().unwrap().elapsed();
                if elapsed < timeout {
                    return false;
                }
                if self.notify_idle_timeout() {
                    self.close(ErrorCode::NoError, "idle_timeout", Callback::noop());
                    true
                } else {
                    self.not_idle();
                    false
                }
            }
            CloseState::LocallyClosed | CloseState::RemotelyClosed => {
                self.abort(Error::Timeout(self.endpoint.idle_timeout()));
                false
            }
            CloseState::Closed => false,
        }
    }

    /// Unrecoverable failure: notify the listener and terminate.
    pub fn abort(self: &Arc<Self>, failure: Error) {
        self.notify_failure(&failure);
        self.terminate(failure);
    }

    /// Move to Closed from whatever state we are in: terminate the
    /// flusher (failing pending callbacks), close and drop every
    /// stream, close the transport. Exactly one caller wins.
    pub(crate) fn terminate(self: &Arc<Self>, cause: Error) {
        loop {
            let current = self.close_state();
            match current {
                CloseState::Closed => return,
                _ => {
                    if self.cas_close_state(current, CloseState::Closed) {
                        tracing::debug!(cause = %cause, "terminating session");
                        self.flusher.terminate(cause);
                        let streams: Vec<Arc<Stream>> =
                            self.streams.iter().map(|s| s.value().clone()).collect();
                        self.streams.clear();
                        for stream in streams {
                            stream.close();
                        }
                        self.local_stream_count.store(0, Ordering::Release);
                        self.remote_stream_count.store(0, Ordering::Release);
                        self.disconnect();
                        return;
                    }
                }
            }
        }
    }

    /// Close the transport.
    pub fn disconnect(&self) {
        tracing::debug!("disconnecting");
        self.endpoint.close();
    }

    /// Whether the transport has been closed.
    pub fn is_disconnected(&self) -> bool {
        !self.endpoint.is_open()
    }

    // --- listener notification ----------------------------------------
    //
    // An exception thrown by the application is logged and must not
    // propagate into the engine.

    pub(crate) fn notify_new_stream(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        frame: &HeadersFrame,
    ) -> Option<Arc<dyn StreamListener>> {
        catch_unwind(AssertUnwindSafe(|| self.listener.on_new_stream(stream, frame)))
            .unwrap_or_else(|_| {
                tracing::warn!("session listener panicked in on_new_stream");
                None
            })
    }

    fn notify_settings(self: &Arc<Self>, frame: &SettingsFrame) {
        if catch_unwind(AssertUnwindSafe(|| self.listener.on_settings(self, frame))).is_err() {
            tracing::warn!("session listener panicked in on_settings");
        }
    }

    fn notify_ping(self: &Arc<Self>, frame: &PingFrame) {
        if catch_unwind(AssertUnwindSafe(|| self.listener.on_ping(self, frame))).is_err() {
            tracing::warn!("session listener panicked in on_ping");
        }
    }

    fn notify_reset(self: &Arc<Self>, frame: &ResetFrame) {
        if catch_unwind(AssertUnwindSafe(|| self.listener.on_reset(self, frame))).is_err() {
            tracing::warn!("session listener panicked in on_reset");
        }
    }

    fn notify_close(self: &Arc<Self>, frame: &GoAwayFrame) {
        if catch_unwind(AssertUnwindSafe(|| self.listener.on_close(self, frame))).is_err() {
            tracing::warn!("session listener panicked in on_close");
        }
    }

    fn notify_idle_timeout(self: &Arc<Self>) -> bool {
        catch_unwind(AssertUnwindSafe(|| self.listener.on_idle_timeout(self))).unwrap_or_else(
            |_| {
                tracing::warn!("session listener panicked in on_idle_timeout");
                true
            },
        )
    }

    fn notify_failure(self: &Arc<Self>, failure: &Error) {
        if catch_unwind(AssertUnwindSafe(|| self.listener.on_failure(self, failure))).is_err() {
            tracing::warn!("session listener panicked in on_failure");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Unblock the writer thread; without this it would park forever
        // on a queue nobody can fill anymore.
        self.flusher.terminate(Error::SessionClosed);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("send_window", &self.send_window())
            .field("recv_window", &self.recv_window())
            .field("streams", &self.stream_count())
            .field("close_state", &self.close_state())
            .finish()
    }
}

impl FrameSink for Arc<Session> {
    fn on_frame(&self, frame: Frame) {
        Session::on_frame(self, frame);
    }

    fn on_connection_failure(&self, code: ErrorCode, reason: &str) {
        Session::on_connection_failure(self, code, reason);
    }

    fn on_stream_failure(&self, stream_id: u32, code: ErrorCode, reason: &str) {
        Session::on_stream_failure(self, stream_id, code, reason);
    }
}
