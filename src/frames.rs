//! HTTP/2 frame types and utilities
//!
//! This module defines the frame types specified in RFC 7540 Section 6,
//! plus the internal DISCONNECT marker the session queues to drain and
//! close the connection.

use crate::error::ErrorCode;
use crate::settings::Settings;
use bytes::Bytes;
use std::fmt;

/// Maximum reason length carried by a GOAWAY frame, in UTF-8 bytes.
pub const GO_AWAY_REASON_MAX_LENGTH: usize = 32;

/// HTTP/2 frame types (RFC 7540 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// DATA frame (0x0) - Conveys arbitrary, variable-length sequences of octets
    Data = 0x0,
    /// HEADERS frame (0x1) - Opens a stream and carries header block fragment
    Headers = 0x1,
    /// PRIORITY frame (0x2) - Specifies sender-advised priority of a stream
    Priority = 0x2,
    /// RST_STREAM frame (0x3) - Allows immediate termination of a stream
    RstStream = 0x3,
    /// SETTINGS frame (0x4) - Conveys configuration parameters
    Settings = 0x4,
    /// PUSH_PROMISE frame (0x5) - Used to notify peer of intent to initiate stream
    PushPromise = 0x5,
    /// PING frame (0x6) - Mechanism for measuring round-trip time
    Ping = 0x6,
    /// GOAWAY frame (0x7) - Initiates shutdown of connection
    Goaway = 0x7,
    /// WINDOW_UPDATE frame (0x8) - Implements flow control
    WindowUpdate = 0x8,
    /// CONTINUATION frame (0x9) - Continues sequence of header block fragments
    Continuation = 0x9,
    /// Internal marker: drain the outbound queue, then close the transport.
    /// Never serialized on the wire.
    Disconnect = 0xff,
}

impl FrameType {
    /// Convert frame type to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create frame type from u8
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    /// Get frame type name
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
            FrameType::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// HTTP/2 frame flags
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// END_STREAM flag (0x1)
    pub const END_STREAM: u8 = 0x1;

    /// ACK flag (0x1) - used for SETTINGS and PING
    pub const ACK: u8 = 0x1;

    /// END_HEADERS flag (0x4)
    pub const END_HEADERS: u8 = 0x4;

    /// PADDED flag (0x8)
    pub const PADDED: u8 = 0x8;

    /// PRIORITY flag (0x20)
    pub const PRIORITY: u8 = 0x20;

    /// Create empty flags
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    /// Create from u8
    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    /// Get raw u8 value
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Set a flag
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Check if a flag is set
    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    /// Check if END_STREAM is set
    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    /// Check if ACK is set
    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    /// Check if END_HEADERS is set
    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    /// Check if PADDED is set
    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    /// Check if PRIORITY is set
    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// A decoded header field.
pub type HeaderField = (String, String);

/// DATA frame (RFC 7540 Section 6.1)
#[derive(Debug, Clone)]
pub struct DataFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Data payload
    pub data: Bytes,
    /// END_STREAM flag
    pub end_stream: bool,
    /// Padding length (if PADDED flag is set)
    pub padding: Option<u8>,
}

impl DataFrame {
    /// Create a new DATA frame
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    /// Set padding
    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Payload bytes still to be delivered
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Length charged against flow control windows: payload plus padding.
    pub fn flow_control_length(&self) -> usize {
        self.data.len() + self.padding.map(|p| p as usize).unwrap_or(0)
    }
}

/// Priority specification (RFC 7540 Section 6.3)
#[derive(Debug, Clone, Copy)]
pub struct PrioritySpec {
    /// Stream dependency
    pub stream_dependency: u32,
    /// Exclusive flag
    pub exclusive: bool,
    /// Weight (1-256, stored as weight-1)
    pub weight: u8,
}

impl PrioritySpec {
    /// Create a new priority specification
    pub fn new(stream_dependency: u32, exclusive: bool, weight: u8) -> Self {
        PrioritySpec {
            stream_dependency,
            exclusive,
            weight,
        }
    }
}

/// HEADERS frame (RFC 7540 Section 6.2)
///
/// Carries the decoded header field list; HPACK encoding happens as
/// late as possible, when the frame is flushed.
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    /// Stream ID (0 = assign on submission)
    pub stream_id: u32,
    /// Header fields
    pub fields: Vec<HeaderField>,
    /// Priority information (if PRIORITY flag is set)
    pub priority: Option<PrioritySpec>,
    /// END_STREAM flag
    pub end_stream: bool,
}

impl HeadersFrame {
    /// Create a new HEADERS frame
    pub fn new(stream_id: u32, fields: Vec<HeaderField>, end_stream: bool) -> Self {
        HeadersFrame {
            stream_id,
            fields,
            priority: None,
            end_stream,
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: PrioritySpec) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Copy of this frame rebound to a concrete stream id
    pub fn with_stream_id(mut self, stream_id: u32) -> Self {
        self.stream_id = stream_id;
        self
    }
}

/// PRIORITY frame (RFC 7540 Section 6.3)
#[derive(Debug, Clone, Copy)]
pub struct PriorityFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Priority specification
    pub priority: PrioritySpec,
}

impl PriorityFrame {
    /// Create a new PRIORITY frame
    pub fn new(stream_id: u32, priority: PrioritySpec) -> Self {
        PriorityFrame {
            stream_id,
            priority,
        }
    }
}

/// RST_STREAM frame (RFC 7540 Section 6.4)
#[derive(Debug, Clone, Copy)]
pub struct ResetFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Error code
    pub error_code: ErrorCode,
}

impl ResetFrame {
    /// Create a new RST_STREAM frame
    pub fn new(stream_id: u32, error_code: ErrorCode) -> Self {
        ResetFrame {
            stream_id,
            error_code,
        }
    }
}

/// SETTINGS frame (RFC 7540 Section 6.5)
#[derive(Debug, Clone)]
pub struct SettingsFrame {
    /// ACK flag
    pub ack: bool,
    /// Settings parameters
    pub settings: Settings,
}

impl SettingsFrame {
    /// Create a new SETTINGS frame
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    /// Create a SETTINGS ACK frame
    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::new(),
        }
    }
}

/// PUSH_PROMISE frame (RFC 7540 Section 6.6)
#[derive(Debug, Clone)]
pub struct PushPromiseFrame {
    /// Stream ID of the associated request stream
    pub stream_id: u32,
    /// Promised stream ID (0 = assign on submission)
    pub promised_stream_id: u32,
    /// Header fields of the promised request
    pub fields: Vec<HeaderField>,
}

impl PushPromiseFrame {
    /// Create a new PUSH_PROMISE frame
    pub fn new(stream_id: u32, promised_stream_id: u32, fields: Vec<HeaderField>) -> Self {
        PushPromiseFrame {
            stream_id,
            promised_stream_id,
            fields,
        }
    }

    /// Copy of this frame rebound to a concrete promised stream id
    pub fn with_promised_stream_id(mut self, promised_stream_id: u32) -> Self {
        self.promised_stream_id = promised_stream_id;
        self
    }
}

/// PING frame (RFC 7540 Section 6.7)
#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    /// ACK flag
    pub ack: bool,
    /// Opaque data (8 bytes)
    pub data: [u8; 8],
}

impl PingFrame {
    /// Create a new PING frame
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    /// Create a PING ACK frame
    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }
}

/// GOAWAY frame (RFC 7540 Section 6.8)
#[derive(Debug, Clone)]
pub struct GoAwayFrame {
    /// Last stream ID processed by the sender
    pub last_stream_id: u32,
    /// Error code
    pub error_code: ErrorCode,
    /// Debug data
    pub debug_data: Bytes,
}

impl GoAwayFrame {
    /// Create a new GOAWAY frame
    pub fn new(last_stream_id: u32, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoAwayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }

    /// Create a GOAWAY frame carrying a human-readable reason, truncated
    /// to at most [`GO_AWAY_REASON_MAX_LENGTH`] UTF-8 bytes without
    /// splitting a multi-byte sequence.
    pub fn with_reason(last_stream_id: u32, error_code: ErrorCode, reason: &str) -> Self {
        let truncated = truncate_utf8(reason, GO_AWAY_REASON_MAX_LENGTH);
        GoAwayFrame {
            last_stream_id,
            error_code,
            debug_data: Bytes::copy_from_slice(truncated.as_bytes()),
        }
    }

    /// The debug data interpreted as UTF-8, lossily.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.debug_data).into_owned()
    }
}

/// Truncate to at most `max` bytes, backing up to a char boundary.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// WINDOW_UPDATE frame (RFC 7540 Section 6.9)
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    /// Stream ID (0 for connection-level)
    pub stream_id: u32,
    /// Window size increment
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    /// Create a new WINDOW_UPDATE frame
    pub fn new(stream_id: u32, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }
}

/// A decoded HTTP/2 frame, tagged by type.
///
/// Inbound dispatch and the outbound queue both operate on this enum;
/// the per-type structs above carry the payload details.
#[derive(Debug, Clone)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    Reset(ResetFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    GoAway(GoAwayFrame),
    WindowUpdate(WindowUpdateFrame),
    /// A frame type this engine does not recognize at the top level.
    Unknown(u8),
    /// Internal: drain the queue, then close the transport.
    Disconnect,
}

impl Frame {
    /// Frame type tag
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data(_) => FrameType::Data,
            Frame::Headers(_) => FrameType::Headers,
            Frame::Priority(_) => FrameType::Priority,
            Frame::Reset(_) => FrameType::RstStream,
            Frame::Settings(_) => FrameType::Settings,
            Frame::PushPromise(_) => FrameType::PushPromise,
            Frame::Ping(_) => FrameType::Ping,
            Frame::GoAway(_) => FrameType::Goaway,
            Frame::WindowUpdate(_) => FrameType::WindowUpdate,
            // Unrecognized wire types have no tag of their own; they
            // never reach the generator, and Display renders the raw
            // byte rather than this placeholder.
            Frame::Unknown(_) => FrameType::Continuation,
            Frame::Disconnect => FrameType::Disconnect,
        }
    }

    /// The stream this frame belongs to, 0 for connection-level frames.
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data(f) => f.stream_id,
            Frame::Headers(f) => f.stream_id,
            Frame::Priority(f) => f.stream_id,
            Frame::Reset(f) => f.stream_id,
            Frame::PushPromise(f) => f.stream_id,
            Frame::WindowUpdate(f) => f.stream_id,
            _ => 0,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Keep the actual wire byte: logging a rejected frame as
            // some known type would point diagnosis the wrong way.
            Frame::Unknown(frame_type) => {
                write!(f, "UNKNOWN(0x{:x})#{}", frame_type, self.stream_id())
            }
            _ => write!(f, "{}#{}", self.frame_type().name(), self.stream_id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::Data.as_u8(), 0x0);
        assert_eq!(FrameType::Headers.as_u8(), 0x1);
        assert_eq!(FrameType::Continuation.as_u8(), 0x9);

        assert_eq!(FrameType::from_u8(0x0), Some(FrameType::Data));
        assert_eq!(FrameType::from_u8(0x9), Some(FrameType::Continuation));
        assert_eq!(FrameType::from_u8(0xff), None);
    }

    #[test]
    fn test_frame_flags() {
        let mut flags = FrameFlags::empty();
        assert!(!flags.is_end_stream());

        flags.set(FrameFlags::END_STREAM);
        assert!(flags.is_end_stream());
        assert!(!flags.is_end_headers());

        flags.set(FrameFlags::END_HEADERS);
        assert!(flags.is_end_stream());
        assert!(flags.is_end_headers());
    }

    #[test]
    fn test_data_frame_flow_control_length() {
        let frame = DataFrame::new(1, Bytes::from(vec![0u8; 100]), false);
        assert_eq!(frame.flow_control_length(), 100);

        let padded = frame.with_padding(10);
        assert_eq!(padded.flow_control_length(), 110);
    }

    #[test]
    fn test_goaway_reason_truncation() {
        let frame = GoAwayFrame::with_reason(7, ErrorCode::NoError, "stop");
        assert_eq!(frame.debug_data.as_ref(), b"stop");

        let long = "x".repeat(100);
        let frame = GoAwayFrame::with_reason(7, ErrorCode::NoError, &long);
        assert_eq!(frame.debug_data.len(), GO_AWAY_REASON_MAX_LENGTH);
    }

    #[test]
    fn test_goaway_reason_truncation_char_boundary() {
        // 31 ASCII bytes followed by a 2-byte char: the char must not
        // be split, so only the ASCII prefix survives.
        let reason = format!("{}é", "a".repeat(31));
        let frame = GoAwayFrame::with_reason(1, ErrorCode::ProtocolError, &reason);
        assert_eq!(frame.debug_data.len(), 31);
        assert!(std::str::from_utf8(&frame.debug_data).is_ok());
    }

    #[test]
    fn test_ping_frame() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        let ping = PingFrame::new(data);
        assert!(!ping.ack);
        assert_eq!(ping.data, data);

        let pong = PingFrame::ack(data);
        assert!(pong.ack);
        assert_eq!(pong.data, data);
    }

    #[test]
    fn test_frame_enum_stream_id() {
        let frame = Frame::Data(DataFrame::new(5, Bytes::from("x"), false));
        assert_eq!(frame.stream_id(), 5);
        assert_eq!(frame.frame_type(), FrameType::Data);

        let frame = Frame::Ping(PingFrame::new([0; 8]));
        assert_eq!(frame.stream_id(), 0);

        assert_eq!(Frame::Disconnect.frame_type().name(), "DISCONNECT");
    }

    #[test]
    fn test_unknown_frame_displays_wire_byte() {
        assert_eq!(Frame::Unknown(0x20).to_string(), "UNKNOWN(0x20)#0");
        assert_eq!(Frame::Unknown(0xfe).to_string(), "UNKNOWN(0xfe)#0");
    }
}
