//! Flow control strategies (RFC 7540 Section 5.2).
//!
//! Window bookkeeping is split from the session so the replenishment
//! policy is pluggable: [`SimpleFlowControl`] advertises every
//! consumed chunk back immediately, [`BufferingFlowControl`] batches
//! WINDOW_UPDATE frames until a ratio of the window has been consumed.
//!
//! Send windows are only ever debited by the flusher (via
//! [`FlowControl::on_data_sending`]) and credited when the flusher
//! applies queued inbound WINDOW_UPDATE frames (via
//! [`FlowControl::on_window_update`]); receive windows are credited
//! only after our WINDOW_UPDATE frames are actually written (via
//! [`FlowControl::on_window_update_sent`]), so credit is never usable
//! by the peer before it is advertised.

use crate::error::{Error, Result};
use crate::frames::WindowUpdateFrame;
use crate::session::Session;
use crate::stream::Stream;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default flow control window size (RFC 7540 Section 6.9.2)
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

const MAX_WINDOW_SIZE: i64 = 0x7FFF_FFFF;

/// Credit accounting hooks invoked by the session and the flusher.
pub trait FlowControl: Send + Sync {
    /// Initial send window for new streams (the peer's
    /// SETTINGS_INITIAL_WINDOW_SIZE).
    fn initial_stream_send_window(&self) -> u32;

    /// Initial receive window for new streams (our advertised
    /// SETTINGS_INITIAL_WINDOW_SIZE).
    fn initial_stream_recv_window(&self) -> u32;

    /// A stream was inserted into the registry.
    fn on_stream_created(&self, stream: &Arc<Stream>);

    /// A stream was removed from the registry.
    fn on_stream_destroyed(&self, stream: &Arc<Stream>);

    /// Inbound DATA: debit the receive windows. `stream` is `None`
    /// when the frame raced with a reset; the session window must be
    /// debited regardless.
    fn on_data_received(&self, session: &Arc<Session>, stream: Option<&Arc<Stream>>, length: usize);

    /// The application consumed inbound DATA: replenish windows,
    /// possibly emitting WINDOW_UPDATE frames.
    fn on_data_consumed(&self, session: &Arc<Session>, stream: Option<&Arc<Stream>>, length: usize);

    /// The flusher is about to emit `length` DATA payload bytes:
    /// debit both send windows.
    fn on_data_sending(&self, session: &Arc<Session>, stream: &Arc<Stream>, length: usize);

    /// The DATA bytes were handed to the transport.
    fn on_data_sent(&self, session: &Arc<Session>, stream: &Arc<Stream>, length: usize) {
        let _ = (session, stream, length);
    }

    /// Apply an inbound WINDOW_UPDATE to the send windows. Called by
    /// the flusher only. Overflow past 2^31-1 is a flow control error.
    fn on_window_update(
        &self,
        session: &Arc<Session>,
        stream: Option<&Arc<Stream>>,
        frame: &WindowUpdateFrame,
    ) -> Result<()>;

    /// One of our WINDOW_UPDATE frames was written: credit the local
    /// receive windows.
    fn on_window_update_sent(
        &self,
        session: &Arc<Session>,
        stream: Option<&Arc<Stream>>,
        frame: &WindowUpdateFrame,
    );

    /// SETTINGS_INITIAL_WINDOW_SIZE changed: apply the delta to every
    /// existing stream. `local` selects the side: our own SETTINGS
    /// (about to be written) adjust stream receive windows, the peer's
    /// SETTINGS adjust stream send windows.
    fn update_initial_stream_window(
        &self,
        session: &Arc<Session>,
        new_initial: u32,
        local: bool,
    ) -> Result<()>;
}

/// Window arithmetic shared by the strategies.
struct Accounting {
    initial_stream_send_window: AtomicU32,
    initial_stream_recv_window: AtomicU32,
}

impl Accounting {
    fn new(initial_recv_window: u32) -> Self {
        Accounting {
            initial_stream_send_window: AtomicU32::new(DEFAULT_WINDOW_SIZE),
            initial_stream_recv_window: AtomicU32::new(initial_recv_window),
        }
    }

    fn on_stream_created(&self, stream: &Arc<Stream>) {
        stream.update_send_window(self.initial_stream_send_window.load(Ordering::Acquire) as i32);
        stream.update_recv_window(self.initial_stream_recv_window.load(Ordering::Acquire) as i32);
    }

    fn on_data_received(&self, session: &Arc<Session>, stream: Option<&Arc<Stream>>, length: usize) {
        let delta = -(length as i32);
        session.update_recv_window(delta);
        if let Some(stream) = stream {
            stream.update_recv_window(delta);
        }
    }

    fn on_data_sending(&self, session: &Arc<Session>, stream: &Arc<Stream>, length: usize) {
        if length == 0 {
            return;
        }
        let delta = -(length as i32);
        session.update_send_window(delta);
        stream.update_send_window(delta);
    }

    fn on_window_update(
        &self,
        session: &Arc<Session>,
        stream: Option<&Arc<Stream>>,
        frame: &WindowUpdateFrame,
    ) -> Result<()> {
        let delta = frame.size_increment as i64;
        match stream {
            Some(stream) => {
                // Send windows are mutated only on the flusher thread,
                // so check-then-add cannot race another writer.
                let current = stream.send_window() as i64;
                if current + delta > MAX_WINDOW_SIZE {
                    return Err(Error::FlowControl(format!(
                        "Stream {} send window overflow",
                        stream.id()
                    )));
                }
                stream.update_send_window(delta as i32);
            }
            None => {
                let current = session.send_window() as i64;
                if current + delta > MAX_WINDOW_SIZE {
                    return Err(Error::FlowControl(
                        "Session send window overflow".to_string(),
                    ));
                }
                session.update_send_window(delta as i32);
            }
        }
        Ok(())
    }

    fn on_window_update_sent(
        &self,
        session: &Arc<Session>,
        stream: Option<&Arc<Stream>>,
        frame: &WindowUpdateFrame,
    ) {
        let delta = frame.size_increment as i32;
        match stream {
            Some(stream) => {
                stream.update_recv_window(delta);
            }
            None => {
                session.update_recv_window(delta);
            }
        }
    }

    fn update_initial_stream_window(
        &self,
        session: &Arc<Session>,
        new_initial: u32,
        local: bool,
    ) -> Result<()> {
        if local {
            let old = self
                .initial_stream_recv_window
                .swap(new_initial, Ordering::AcqRel);
            let delta = new_initial as i64 - old as i64;
            if delta != 0 {
                for stream in session.streams() {
                    stream.update_recv_window(delta as i32);
                }
            }
            Ok(())
        } else {
            let old = self
                .initial_stream_send_window
                .swap(new_initial, Ordering::AcqRel);
            let delta = new_initial as i64 - old as i64;
            if delta == 0 {
                return Ok(());
            }
            for stream in session.streams() {
                let previous = stream.update_send_window(delta as i32) as i64;
                if delta > 0 && previous + delta > MAX_WINDOW_SIZE {
                    return Err(Error::FlowControl(format!(
                        "Stream {} send window overflow",
                        stream.id()
                    )));
                }
            }
            Ok(())
        }
    }
}

/// Emits a WINDOW_UPDATE for every consumed chunk.
pub struct SimpleFlowControl {
    accounting: Accounting,
}

impl SimpleFlowControl {
    pub fn new() -> Self {
        Self::with_initial_recv_window(DEFAULT_WINDOW_SIZE)
    }

    pub fn with_initial_recv_window(initial_recv_window: u32) -> Self {
        SimpleFlowControl {
            accounting: Accounting::new(initial_recv_window),
        }
    }
}

impl Default for SimpleFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControl for SimpleFlowControl {
    fn initial_stream_send_window(&self) -> u32 {
        self.accounting
            .initial_stream_send_window
            .load(Ordering::Acquire)
    }

    fn initial_stream_recv_window(&self) -> u32 {
        self.accounting
            .initial_stream_recv_window
            .load(Ordering::Acquire)
    }

    fn on_stream_created(&self, stream: &Arc<Stream>) {
        self.accounting.on_stream_created(stream);
    }

    fn on_stream_destroyed(&self, _stream: &Arc<Stream>) {}

    fn on_data_received(&self, session: &Arc<Session>, stream: Option<&Arc<Stream>>, length: usize) {
        self.accounting.on_data_received(session, stream, length);
    }

    fn on_data_consumed(&self, session: &Arc<Session>, stream: Option<&Arc<Stream>>, length: usize) {
        if length == 0 || session.is_closed() {
            return;
        }
        let mut frames = Vec::with_capacity(2);
        if let Some(stream) = stream {
            if !stream.is_closed() && !stream.is_remotely_closed() {
                frames.push(WindowUpdateFrame::new(stream.id(), length as u32));
            }
        }
        frames.push(WindowUpdateFrame::new(0, length as u32));
        session.enqueue_window_updates(stream, frames);
    }

    fn on_data_sending(&self, session: &Arc<Session>, stream: &Arc<Stream>, length: usize) {
        self.accounting.on_data_sending(session, stream, length);
    }

    fn on_window_update(
        &self,
        session: &Arc<Session>,
        stream: Option<&Arc<Stream>>,
        frame: &WindowUpdateFrame,
    ) -> Result<()> {
        self.accounting.on_window_update(session, stream, frame)
    }

    fn on_window_update_sent(
        &self,
        session: &Arc<Session>,
        stream: Option<&Arc<Stream>>,
        frame: &WindowUpdateFrame,
    ) {
        self.accounting.on_window_update_sent(session, stream, frame);
    }

    fn update_initial_stream_window(
        &self,
        session: &Arc<Session>,
        new_initial: u32,
        local: bool,
    ) -> Result<()> {
        self.accounting
            .update_initial_stream_window(session, new_initial, local)
    }
}

/// Batches window replenishment: WINDOW_UPDATE frames are only emitted
/// once a configurable ratio of the window has been consumed, halving
/// the frame chatter for streaming workloads.
pub struct BufferingFlowControl {
    accounting: Accounting,
    ratio: f32,
    session_recv_window: u32,
    session_level: AtomicUsize,
    stream_levels: DashMap<u32, usize>,
}

impl BufferingFlowControl {
    pub fn new() -> Self {
        Self::with_ratio(0.5)
    }

    /// `ratio` is the fraction of the window that may be consumed
    /// before an update is emitted, in (0, 1].
    pub fn with_ratio(ratio: f32) -> Self {
        assert!(ratio > 0.0 && ratio <= 1.0, "buffer ratio out of range");
        BufferingFlowControl {
            accounting: Accounting::new(DEFAULT_WINDOW_SIZE),
            ratio,
            session_recv_window: DEFAULT_WINDOW_SIZE,
            session_level: AtomicUsize::new(0),
            stream_levels: DashMap::new(),
        }
    }
}

impl Default for BufferingFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControl for BufferingFlowControl {
    fn initial_stream_send_window(&self) -> u32 {
        self.accounting
            .initial_stream_send_window
            .load(Ordering::Acquire)
    }

    fn initial_stream_recv_window(&self) -> u32 {
        self.accounting
            .initial_stream_recv_window
            .load(Ordering::Acquire)
    }

    fn on_stream_created(&self, stream: &Arc<Stream>) {
        self.accounting.on_stream_created(stream);
        self.stream_levels.insert(stream.id(), 0);
    }

    fn on_stream_destroyed(&self, stream: &Arc<Stream>) {
        self.stream_levels.remove(&stream.id());
    }

    fn on_data_received(&self, session: &Arc<Session>, stream: Option<&Arc<Stream>>, length: usize) {
        self.accounting.on_data_received(session, stream, length);
    }

    fn on_data_consumed(&self, session: &Arc<Session>, stream: Option<&Arc<Stream>>, length: usize) {
        if length == 0 || session.is_closed() {
            return;
        }
        let mut frames = Vec::with_capacity(2);

        if let Some(stream) = stream {
            if !stream.is_closed() && !stream.is_remotely_closed() {
                let threshold = (self.initial_stream_recv_window() as f32 * self.ratio) as usize;
                if let Some(mut level) = self.stream_levels.get_mut(&stream.id()) {
                    *level += length;
                    if *level >= threshold {
                        frames.push(WindowUpdateFrame::new(stream.id(), *level as u32));
                        *level = 0;
                    }
                }
            }
        }

        let session_threshold = (self.session_recv_window as f32 * self.ratio) as usize;
        let level = self.session_level.fetch_add(length, Ordering::AcqRel) + length;
        if level >= session_threshold {
            self.session_level.store(0, Ordering::Release);
            frames.push(WindowUpdateFrame::new(0, level as u32));
        }

        if !frames.is_empty() {
            session.enqueue_window_updates(stream, frames);
        }
    }

    fn on_data_sending(&self, session: &Arc<Session>, stream: &Arc<Stream>, length: usize) {
        self.accounting.on_data_sending(session, stream, length);
    }

    fn on_window_update(
        &self,
        session: &Arc<Session>,
        stream: Option<&Arc<Stream>>,
        frame: &WindowUpdateFrame,
    ) -> Result<()> {
        self.accounting.on_window_update(session, stream, frame)
    }

    fn on_window_update_sent(
        &self,
        session: &Arc<Session>,
        stream: Option<&Arc<Stream>>,
        frame: &WindowUpdateFrame,
    ) {
        self.accounting.on_window_update_sent(session, stream, frame);
    }

    fn update_initial_stream_window(
        &self,
        session: &Arc<Session>,
        new_initial: u32,
        local: bool,
    ) -> Result<()> {
        self.accounting
            .update_initial_stream_window(session, new_initial, local)
    }
}
