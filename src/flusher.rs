//! Single-writer outbound frame serializer.
//!
//! The flusher owns the only path to the transport's write side and is
//! the sole mutator of send windows. Submissions from any thread are
//! enqueued and the writer thread is signalled; it drains the queue,
//! applies queued window adjustments, encodes entries (slicing DATA to
//! the available windows), performs one combined transport write, and
//! then runs post-write effects and completion callbacks in order.
//!
//! PING frames are prepended so round-trip measurements are not skewed
//! by a deep queue. DATA entries that find no window are parked and
//! rejoin the queue when window credit arrives.

use crate::callback::Callback;
use crate::error::{Error, ErrorCode};
use crate::frames::{DataFrame, Frame, FrameType, WindowUpdateFrame};
use crate::session::Session;
use crate::stream::Stream;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};

/// One queued outbound submission.
pub(crate) enum Entry {
    /// Any non-DATA frame; encoded in one piece.
    Control {
        frame: Frame,
        stream: Option<Arc<Stream>>,
        callback: Callback,
    },
    /// A DATA frame, consumable in window-limited slices.
    Data {
        stream: Arc<Stream>,
        remaining: Bytes,
        end_stream: bool,
        callback: Callback,
    },
}

impl Entry {
    pub(crate) fn control(frame: Frame, stream: Option<Arc<Stream>>, callback: Callback) -> Self {
        Entry::Control {
            frame,
            stream,
            callback,
        }
    }

    pub(crate) fn data(stream: Arc<Stream>, frame: DataFrame, callback: Callback) -> Self {
        Entry::Data {
            stream,
            remaining: frame.data,
            end_stream: frame.end_stream,
            callback,
        }
    }

    pub(crate) fn is_ping(&self) -> bool {
        matches!(
            self,
            Entry::Control {
                frame: Frame::Ping(_),
                ..
            }
        )
    }

    fn fail(self, error: Error) {
        match self {
            Entry::Control { callback, .. } | Entry::Data { callback, .. } => {
                callback.failed(error)
            }
        }
    }
}

/// A flushed entry awaiting its post-write effects.
enum Written {
    Control {
        frame: Frame,
        stream: Option<Arc<Stream>>,
        callback: Callback,
        bytes: usize,
    },
    Data {
        stream: Arc<Stream>,
        remaining: Bytes,
        end_stream: bool,
        callback: Callback,
        bytes: usize,
        data_len: usize,
    },
}

struct QueueState {
    queue: VecDeque<Entry>,
    stalled: Vec<Entry>,
    window_updates: Vec<(Option<Arc<Stream>>, WindowUpdateFrame)>,
    terminated: Option<Error>,
}

struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

pub(crate) struct Flusher {
    shared: Arc<Shared>,
}

impl Flusher {
    pub(crate) fn new() -> Self {
        Flusher {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    stalled: Vec::new(),
                    window_updates: Vec::new(),
                    terminated: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Spawn the writer thread. The thread exits when the flusher is
    /// terminated or the session is dropped.
    pub(crate) fn spawn(&self, session: Weak<Session>) {
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("h2mux-flusher".into())
            .spawn(move || run(shared, session))
            .expect("failed to spawn flusher thread");
    }

    /// Append an entry. Returns false (failing the entry's callback)
    /// if the flusher has been terminated.
    pub(crate) fn append(&self, entry: Entry) -> bool {
        self.push(entry, false)
    }

    /// Prepend an entry ahead of the backlog.
    pub(crate) fn prepend(&self, entry: Entry) -> bool {
        self.push(entry, true)
    }

    fn push(&self, entry: Entry, front: bool) -> bool {
        let cause = {
            let mut state = self.shared.state.lock().unwrap();
            match &state.terminated {
                Some(cause) => Some(cause.clone()),
                None => {
                    if front {
                        state.queue.push_front(entry);
                    } else {
                        state.queue.push_back(entry);
                    }
                    return true;
                }
            }
        };
        if let Some(cause) = cause {
            entry.fail(cause);
        }
        false
    }

    /// Queue an inbound WINDOW_UPDATE. The writer applies it before
    /// its next flush decision; nothing touches the send windows here.
    pub(crate) fn window(&self, stream: Option<Arc<Stream>>, frame: WindowUpdateFrame) {
        let mut state = self.shared.state.lock().unwrap();
        if state.terminated.is_none() {
            state.window_updates.push((stream, frame));
            self.shared.cond.notify_all();
        }
    }

    /// Wake the writer.
    pub(crate) fn iterate(&self) {
        self.shared.cond.notify_all();
    }

    /// Move parked DATA entries back into the queue and wake the
    /// writer, after anything that may have changed their windows or
    /// closed their stream.
    pub(crate) fn unstall(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.terminated.is_none() && !state.stalled.is_empty() {
            let stalled: Vec<Entry> = state.stalled.drain(..).collect();
            for entry in stalled.into_iter().rev() {
                state.queue.push_front(entry);
            }
            self.shared.cond.notify_all();
        }
    }

    /// Terminate: fail every pending entry with `cause`; subsequent
    /// submissions fail immediately.
    pub(crate) fn terminate(&self, cause: Error) {
        let entries = {
            let mut state = self.shared.state.lock().unwrap();
            if state.terminated.is_some() {
                return;
            }
            state.terminated = Some(cause.clone());
            state.window_updates.clear();
            let mut entries: Vec<Entry> = state.queue.drain(..).collect();
            entries.extend(state.stalled.drain(..));
            self.shared.cond.notify_all();
            entries
        };
        for entry in entries {
            entry.fail(cause.clone());
        }
    }
}

fn run(shared: Arc<Shared>, session: Weak<Session>) {
    loop {
        // Collect a batch of work, parking while there is none.
        let (updates, batch) = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.terminated.is_some() {
                    return;
                }
                let has_updates = !state.window_updates.is_empty();
                if has_updates && !state.stalled.is_empty() {
                    // Window credit may release parked data; keep the
                    // original submission order.
                    let stalled: Vec<Entry> = state.stalled.drain(..).collect();
                    for entry in stalled.into_iter().rev() {
                        state.queue.push_front(entry);
                    }
                }
                if state.queue.is_empty() && !has_updates {
                    state = shared.cond.wait(state).unwrap();
                    continue;
                }
                let updates = std::mem::take(&mut state.window_updates);
                let batch: Vec<Entry> = state.queue.drain(..).collect();
                break (updates, batch);
            }
        };

        let Some(session) = session.upgrade() else {
            return;
        };

        // 1. Apply queued window adjustments before any flush decision.
        for (stream, frame) in updates {
            if let Err(e) = session
                .flow_control()
                .on_window_update(&session, stream.as_ref(), &frame)
            {
                tracing::debug!(error = %e, "window update overflow");
                match stream {
                    Some(stream) => session.reset(
                        crate::frames::ResetFrame::new(stream.id(), ErrorCode::FlowControlError),
                        Callback::noop(),
                    ),
                    None => session
                        .on_connection_failure(ErrorCode::FlowControlError, "window_overflow"),
                }
            }
        }

        // 2. Encode the batch, slicing DATA to the available windows.
        let mut buf = BytesMut::new();
        let mut written: Vec<Written> = Vec::new();
        let mut stalled_now: Vec<Entry> = Vec::new();
        let mut unprocessed: Vec<Entry> = Vec::new();

        let mut iter = batch.into_iter();
        while let Some(entry) = iter.next() {
            match entry {
                Entry::Control {
                    frame,
                    stream,
                    callback,
                } => {
                    prepare(&session, &frame);
                    match session.generator().control(&frame) {
                        Ok(bytes) => {
                            tracing::trace!(frame = %frame, "generated");
                            buf.extend_from_slice(&bytes);
                            written.push(Written::Control {
                                frame,
                                stream,
                                callback,
                                bytes: bytes.len(),
                            });
                        }
                        Err(e) => callback.failed(e),
                    }
                }
                Entry::Data {
                    stream,
                    mut remaining,
                    end_stream,
                    callback,
                } => {
                    if stream.is_reset() {
                        callback.failed(Error::StreamClosed(stream.id()));
                        continue;
                    }
                    let session_window = session.send_window() as i64;
                    let stream_window = stream.send_window() as i64;
                    let window = session_window.min(stream_window);
                    if window <= 0 && !remaining.is_empty() {
                        stalled_now.push(Entry::Data {
                            stream,
                            remaining,
                            end_stream,
                            callback,
                        });
                        continue;
                    }

                    let cap = session.generator().max_frame_size() as usize;
                    let len = remaining.len().min(window.max(0) as usize).min(cap);
                    let chunk = remaining.split_to(len);
                    let end = end_stream && remaining.is_empty();

                    session.flow_control().on_data_sending(&session, &stream, len);
                    let bytes = session.generator().data(stream.id(), &chunk, end);
                    tracing::trace!(
                        stream_id = stream.id(),
                        len,
                        window,
                        "generated DATA"
                    );
                    buf.extend_from_slice(&bytes);
                    let partial = !remaining.is_empty();
                    written.push(Written::Data {
                        stream,
                        remaining,
                        end_stream,
                        callback,
                        bytes: bytes.len(),
                        data_len: len,
                    });
                    if partial {
                        // Stop here: the rest of this entry must reach
                        // the wire before anything queued after it.
                        unprocessed.extend(iter.by_ref());
                        break;
                    }
                }
            }
        }

        // 3. One combined transport write.
        if !buf.is_empty() {
            if let Err(e) = session.endpoint().write(&buf) {
                let error = Error::Io(e);
                tracing::debug!(error = %error, "transport write failed");
                for w in written {
                    match w {
                        Written::Control { callback, .. } | Written::Data { callback, .. } => {
                            callback.failed(error.clone())
                        }
                    }
                }
                requeue(&shared, Vec::new(), unprocessed, stalled_now);
                session.abort(error);
                continue;
            }
        }

        // 4. Post-write effects and completions, in emission order.
        let mut requeue_front: Vec<Entry> = Vec::new();
        for w in written {
            match w {
                Written::Control {
                    frame,
                    stream,
                    callback,
                    bytes,
                } => {
                    session.add_bytes_written(bytes as u64);
                    match &frame {
                        Frame::Headers(f) => {
                            if let Some(stream) = &stream {
                                session.on_stream_opened(stream);
                                if stream.update_close(f.end_stream, true) {
                                    session.remove_stream(stream);
                                }
                            }
                        }
                        Frame::Reset(_) => {
                            if let Some(stream) = &stream {
                                stream.close();
                                session.remove_stream(stream);
                            }
                        }
                        Frame::PushPromise(_) => {
                            // Pushed streams are implicitly remotely
                            // closed; they finish with an end-stream
                            // DATA frame.
                            if let Some(stream) = &stream {
                                stream.update_close(true, false);
                            }
                        }
                        Frame::GoAway(_) => {
                            // Only shut down the output: reads continue
                            // until the peer closes the connection.
                            let _ = session.endpoint().shutdown_output();
                        }
                        Frame::WindowUpdate(f) => {
                            session
                                .flow_control()
                                .on_window_update_sent(&session, stream.as_ref(), f);
                        }
                        Frame::Disconnect => {
                            session.terminate(Error::SessionClosed);
                        }
                        _ => {}
                    }
                    callback.succeeded();
                }
                Written::Data {
                    stream,
                    remaining,
                    end_stream,
                    callback,
                    bytes,
                    data_len,
                } => {
                    session.add_bytes_written(bytes as u64);
                    session.flow_control().on_data_sent(&session, &stream, data_len);
                    if remaining.is_empty() {
                        if stream.update_close(end_stream, true) {
                            session.remove_stream(&stream);
                        }
                        callback.succeeded();
                    } else {
                        requeue_front.push(Entry::Data {
                            stream,
                            remaining,
                            end_stream,
                            callback,
                        });
                    }
                }
            }
        }

        requeue(&shared, requeue_front, unprocessed, stalled_now);
    }
}

/// Return leftovers to the queue: the partially-written remainder goes
/// first, then the entries that were never examined; parked entries go
/// to the stalled list. If the flusher terminated meanwhile, fail them.
fn requeue(
    shared: &Arc<Shared>,
    requeue_front: Vec<Entry>,
    unprocessed: Vec<Entry>,
    stalled_now: Vec<Entry>,
) {
    let failed: Vec<(Entry, Error)> = {
        let mut state = shared.state.lock().unwrap();
        match &state.terminated {
            Some(cause) => {
                let cause = cause.clone();
                requeue_front
                    .into_iter()
                    .chain(unprocessed)
                    .chain(stalled_now)
                    .map(|e| (e, cause.clone()))
                    .collect()
            }
            None => {
                for entry in unprocessed.into_iter().rev() {
                    state.queue.push_front(entry);
                }
                for entry in requeue_front.into_iter().rev() {
                    state.queue.push_front(entry);
                }
                state.stalled.extend(stalled_now);
                Vec::new()
            }
        }
    };
    for (entry, cause) in failed {
        entry.fail(cause);
    }
}

/// Pre-write hook: actions that must happen atomically with a frame's
/// emission. A SETTINGS carrying INITIAL_WINDOW_SIZE applies to the
/// local view here, so reply frames from the peer are measured against
/// the new window and never rejected by a stale one.
fn prepare(session: &Arc<Session>, frame: &Frame) {
    if let Frame::Settings(settings_frame) = frame {
        if settings_frame.ack {
            return;
        }
        if let Some(initial_window) = settings_frame.settings.initial_window_size {
            let _ = session
                .flow_control()
                .update_initial_stream_window(session, initial_window, true);
        }
    }
    debug_assert!(frame.frame_type() != FrameType::Data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{PingFrame, SettingsFrame};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ping_entry() -> Entry {
        Entry::control(Frame::Ping(PingFrame::new([0; 8])), None, Callback::noop())
    }

    fn settings_entry(callback: Callback) -> Entry {
        Entry::control(Frame::Settings(SettingsFrame::ack()), None, callback)
    }

    #[test]
    fn test_entry_is_ping() {
        assert!(ping_entry().is_ping());
        assert!(!settings_entry(Callback::noop()).is_ping());
    }

    #[test]
    fn test_data_entry_carries_payload_and_end_stream() {
        let stream = crate::stream::Stream::new(Weak::new(), 1, true);
        let frame = DataFrame::new(1, Bytes::from_static(b"abc"), true);
        match Entry::data(stream, frame, Callback::noop()) {
            Entry::Data {
                remaining,
                end_stream,
                ..
            } => {
                assert_eq!(remaining.as_ref(), b"abc");
                assert!(end_stream);
            }
            Entry::Control { .. } => panic!("expected a data entry"),
        }
    }

    #[test]
    fn test_prepend_orders_ahead_of_backlog() {
        let flusher = Flusher::new();
        assert!(flusher.append(settings_entry(Callback::noop())));
        assert!(flusher.prepend(ping_entry()));

        let state = flusher.shared.state.lock().unwrap();
        assert_eq!(state.queue.len(), 2);
        assert!(matches!(
            &state.queue[0],
            Entry::Control {
                frame: Frame::Ping(_),
                ..
            }
        ));
        assert!(matches!(
            &state.queue[1],
            Entry::Control {
                frame: Frame::Settings(_),
                ..
            }
        ));
    }

    #[test]
    fn test_terminate_fails_pending_entries_in_order() {
        let flusher = Flusher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..2 {
            let order = Arc::clone(&order);
            flusher.append(settings_entry(Callback::non_blocking(move |result| {
                assert!(result.is_err());
                order.lock().unwrap().push(i);
            })));
        }

        flusher.terminate(Error::SessionClosed);
        assert_eq!(order.lock().unwrap().as_slice(), &[0, 1]);

        // A second terminate has nothing left to fail.
        flusher.terminate(Error::SessionClosed);
        assert_eq!(order.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_append_after_terminate_fails_the_entry() {
        let flusher = Flusher::new();
        flusher.terminate(Error::SessionClosed);

        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        let queued = flusher.append(settings_entry(Callback::non_blocking(move |result| {
            assert!(result.is_err());
            flag.store(true, Ordering::SeqCst);
        })));
        assert!(!queued);
        assert!(failed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_window_after_terminate_is_dropped() {
        let flusher = Flusher::new();
        flusher.terminate(Error::SessionClosed);
        flusher.window(None, WindowUpdateFrame::new(0, 100));
        assert!(flusher
            .shared
            .state
            .lock()
            .unwrap()
            .window_updates
            .is_empty());
    }

    #[test]
    fn test_unstall_moves_parked_entries_to_queue_front() {
        let flusher = Flusher::new();
        flusher.append(settings_entry(Callback::noop()));
        {
            let mut state = flusher.shared.state.lock().unwrap();
            state.stalled.push(ping_entry());
        }

        flusher.unstall();

        let state = flusher.shared.state.lock().unwrap();
        assert!(state.stalled.is_empty());
        assert_eq!(state.queue.len(), 2);
        // Parked entries predate the backlog and go back in front.
        assert!(matches!(
            &state.queue[0],
            Entry::Control {
                frame: Frame::Ping(_),
                ..
            }
        ));
    }
}
