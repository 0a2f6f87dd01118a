//! Listener contracts and role policies.
//!
//! Applications observe the session through [`SessionListener`] and
//! each stream through [`StreamListener`]; every method has a no-op
//! default, so implementations override only what they need. The
//! engine wraps every notification in a panic harness.
//!
//! Role-specific HEADERS and PUSH_PROMISE handling is a strategy
//! ([`StreamPolicy`]) composed into the session: [`ServerPolicy`]
//! opens remote streams on new ids, [`ClientPolicy`] routes response
//! headers and promised streams.

use crate::error::{Error, ErrorCode};
use crate::frames::{
    DataFrame, GoAwayFrame, HeadersFrame, PingFrame, PushPromiseFrame, ResetFrame, SettingsFrame,
};
use crate::session::{Consumed, Session};
use crate::stream::Stream;
use std::sync::Arc;

/// Session-level events.
pub trait SessionListener: Send + Sync {
    /// A remote stream was opened. Return a listener for it, if the
    /// application wants stream events.
    fn on_new_stream(
        &self,
        stream: &Arc<Stream>,
        frame: &HeadersFrame,
    ) -> Option<Arc<dyn StreamListener>> {
        let _ = (stream, frame);
        None
    }

    /// A SETTINGS frame was received and applied.
    fn on_settings(&self, session: &Arc<Session>, frame: &SettingsFrame) {
        let _ = (session, frame);
    }

    /// A PING reply was received.
    fn on_ping(&self, session: &Arc<Session>, frame: &PingFrame) {
        let _ = (session, frame);
    }

    /// A RST_STREAM arrived for a stream this session does not know.
    fn on_reset(&self, session: &Arc<Session>, frame: &ResetFrame) {
        let _ = (session, frame);
    }

    /// The peer announced shutdown with a GOAWAY frame.
    fn on_close(&self, session: &Arc<Session>, frame: &GoAwayFrame) {
        let _ = (session, frame);
    }

    /// The session idle timeout expired; return whether to close.
    fn on_idle_timeout(&self, session: &Arc<Session>) -> bool {
        let _ = session;
        true
    }

    /// The session failed and is being torn down.
    fn on_failure(&self, session: &Arc<Session>, failure: &Error) {
        let _ = (session, failure);
    }
}

/// Stream-level events.
pub trait StreamListener: Send + Sync {
    /// Headers (or trailers) arrived on the stream.
    fn on_headers(&self, stream: &Arc<Stream>, frame: &HeadersFrame) {
        let _ = (stream, frame);
    }

    /// Data arrived. Call [`Consumed::complete`] once the bytes have
    /// been consumed, so the flow control windows are replenished.
    fn on_data(&self, stream: &Arc<Stream>, frame: &DataFrame, consumed: Consumed) {
        let _ = (stream, frame);
        consumed.complete();
    }

    /// The peer reset the stream.
    fn on_reset(&self, stream: &Arc<Stream>, frame: &ResetFrame) {
        let _ = (stream, frame);
    }

    /// The stream idle timeout expired; return whether to reset it.
    fn on_idle_timeout(&self, stream: &Arc<Stream>) -> bool {
        let _ = stream;
        true
    }
}

// `Arc::new(())` makes a perfectly good do-nothing listener.
impl SessionListener for () {}
impl StreamListener for () {}

/// Role-specific inbound HEADERS / PUSH_PROMISE handling.
pub trait StreamPolicy: Send + Sync {
    /// Handle an inbound HEADERS frame.
    fn on_headers(&self, session: &Arc<Session>, frame: HeadersFrame);

    /// Handle an inbound PUSH_PROMISE frame.
    fn on_push_promise(&self, session: &Arc<Session>, frame: PushPromiseFrame);
}

/// Server role: peer-initiated HEADERS on a new id open a stream;
/// HEADERS on a known id are trailers. Servers never receive pushes.
pub struct ServerPolicy;

impl StreamPolicy for ServerPolicy {
    fn on_headers(&self, session: &Arc<Session>, frame: HeadersFrame) {
        match session.stream(frame.stream_id) {
            Some(stream) => {
                // A second HEADERS on an open stream is only legal as
                // trailers, which must carry END_STREAM; anything else
                // is an attempt to reopen the stream.
                if frame.end_stream {
                    stream.process_headers(session, &frame);
                } else {
                    session.on_connection_failure(ErrorCode::ProtocolError, "duplicate_stream");
                }
            }
            None => {
                if let Some(stream) = session.create_remote_stream(frame.stream_id) {
                    if let Some(listener) = session.notify_new_stream(&stream, &frame) {
                        stream.set_listener(listener);
                    }
                    stream.process_headers(session, &frame);
                }
            }
        }
    }

    fn on_push_promise(&self, session: &Arc<Session>, frame: PushPromiseFrame) {
        // RFC 7540 Section 8.2: clients cannot push.
        let _ = frame;
        session.on_connection_failure(ErrorCode::ProtocolError, "push_promise");
    }
}

/// Client role: inbound HEADERS carry responses for streams this side
/// opened; PUSH_PROMISE reserves a remote stream on the promised id.
pub struct ClientPolicy;

impl StreamPolicy for ClientPolicy {
    fn on_headers(&self, session: &Arc<Session>, frame: HeadersFrame) {
        match session.stream(frame.stream_id) {
            Some(stream) => stream.process_headers(session, &frame),
            None => {
                // Response for a stream already reset or completed.
                tracing::debug!(
                    stream_id = frame.stream_id,
                    "ignoring HEADERS, stream not found"
                );
            }
        }
    }

    fn on_push_promise(&self, session: &Arc<Session>, frame: PushPromiseFrame) {
        if session.stream(frame.stream_id).is_none() {
            tracing::debug!(
                stream_id = frame.stream_id,
                "ignoring PUSH_PROMISE, associated stream not found"
            );
            return;
        }
        if let Some(stream) = session.create_remote_stream(frame.promised_stream_id) {
            // A promised stream is half closed (local): this side only
            // receives on it.
            stream.update_close(true, true);
            let headers = HeadersFrame::new(frame.promised_stream_id, frame.fields.clone(), false);
            if let Some(listener) = session.notify_new_stream(&stream, &headers) {
                stream.set_listener(listener);
            }
        }
    }
}
