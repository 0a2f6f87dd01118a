//! HTTP/2 frame encoding and decoding
//!
//! [`Generator`] turns typed frames into wire bytes; it is driven by
//! the flusher so that HPACK encoding happens as late as possible and
//! its dynamic table is only ever touched by the single writer.
//! [`Parser`] consumes raw transport bytes incrementally and delivers
//! decoded frames to a [`FrameSink`] (the session).

use crate::error::{Error, ErrorCode, Result};
use crate::frames::*;
use crate::settings::Settings;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Per RFC 7540 Section 5.2.2: 32 bytes of overhead per header field
/// when computing the header list size.
const HEADER_FIELD_OVERHEAD: usize = 32;

/// Encode a frame header
pub fn encode_frame_header(
    frame_type: FrameType,
    flags: FrameFlags,
    stream_id: u32,
    length: usize,
) -> [u8; FRAME_HEADER_SIZE] {
    let mut header = [0u8; FRAME_HEADER_SIZE];

    // Length (24 bits, big-endian)
    header[0] = ((length >> 16) & 0xFF) as u8;
    header[1] = ((length >> 8) & 0xFF) as u8;
    header[2] = (length & 0xFF) as u8;

    // Type (8 bits)
    header[3] = frame_type.as_u8();

    // Flags (8 bits)
    header[4] = flags.as_u8();

    // Stream ID (31 bits, big-endian, reserved bit is 0)
    let stream_id = stream_id & 0x7FFF_FFFF;
    header[5] = ((stream_id >> 24) & 0xFF) as u8;
    header[6] = ((stream_id >> 16) & 0xFF) as u8;
    header[7] = ((stream_id >> 8) & 0xFF) as u8;
    header[8] = (stream_id & 0xFF) as u8;

    header
}

/// Decode a frame header
pub fn decode_frame_header(bytes: &[u8]) -> (u8, FrameFlags, u32, usize) {
    let length =
        ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
    let frame_type = bytes[3];
    let flags = FrameFlags::from_u8(bytes[4]);
    // Stream ID (31 bits, ignore reserved bit)
    let stream_id = ((bytes[5] as u32 & 0x7F) << 24)
        | ((bytes[6] as u32) << 16)
        | ((bytes[7] as u32) << 8)
        | (bytes[8] as u32);
    (frame_type, flags, stream_id, length)
}

/// Stateful frame encoder.
///
/// The caps are reconfigured from inbound SETTINGS (parser thread)
/// while the flusher encodes, hence the atomics; the HPACK encoder is
/// only ever used by the flusher but sits behind a mutex so the
/// generator stays `Sync`.
pub struct Generator {
    hpack: Mutex<hpack::Encoder<'static>>,
    header_table_size: AtomicU32,
    max_frame_size: AtomicU32,
    max_header_list_size: AtomicUsize,
}

impl Generator {
    /// Create a generator with RFC 7540 defaults.
    pub fn new() -> Self {
        Generator {
            hpack: Mutex::new(hpack::Encoder::new()),
            header_table_size: AtomicU32::new(crate::DEFAULT_HEADER_TABLE_SIZE),
            max_frame_size: AtomicU32::new(crate::DEFAULT_MAX_FRAME_SIZE),
            max_header_list_size: AtomicUsize::new(usize::MAX),
        }
    }

    /// Record the peer's advertised header table size.
    pub fn set_header_table_size(&self, size: u32) {
        self.header_table_size.store(size, Ordering::Release);
    }

    /// The peer's advertised header table size.
    pub fn header_table_size(&self) -> u32 {
        self.header_table_size.load(Ordering::Acquire)
    }

    /// Cap the payload size of generated frames.
    pub fn set_max_frame_size(&self, size: u32) {
        self.max_frame_size.store(size, Ordering::Release);
    }

    /// Current frame payload cap.
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.load(Ordering::Acquire)
    }

    /// Cap the size of generated header lists.
    pub fn set_max_header_list_size(&self, size: usize) {
        self.max_header_list_size.store(size, Ordering::Release);
    }

    /// Encode any non-DATA frame. The internal DISCONNECT marker
    /// produces no bytes.
    pub fn control(&self, frame: &Frame) -> Result<Bytes> {
        match frame {
            Frame::Headers(f) => self.encode_headers(f),
            Frame::Priority(f) => Ok(encode_priority(f)),
            Frame::Reset(f) => Ok(encode_reset(f)),
            Frame::Settings(f) => Ok(encode_settings(f)),
            Frame::PushPromise(f) => self.encode_push_promise(f),
            Frame::Ping(f) => Ok(encode_ping(f)),
            Frame::GoAway(f) => Ok(encode_go_away(f)),
            Frame::WindowUpdate(f) => Ok(encode_window_update(f)),
            Frame::Disconnect => Ok(Bytes::new()),
            Frame::Data(_) | Frame::Unknown(_) => Err(Error::Internal(format!(
                "cannot generate {} as a control frame",
                frame
            ))),
        }
    }

    /// Encode one DATA frame carrying `chunk`.
    ///
    /// The caller has already sliced `chunk` to fit the flow control
    /// windows and the frame size cap.
    pub fn data(&self, stream_id: u32, chunk: &[u8], end_stream: bool) -> Bytes {
        let mut flags = FrameFlags::empty();
        if end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + chunk.len());
        buf.put_slice(&encode_frame_header(
            FrameType::Data,
            flags,
            stream_id,
            chunk.len(),
        ));
        buf.put_slice(chunk);
        buf.freeze()
    }

    fn encode_fields(&self, fields: &[HeaderField]) -> Result<Vec<u8>> {
        let list_size: usize = fields
            .iter()
            .map(|(n, v)| n.len() + v.len() + HEADER_FIELD_OVERHEAD)
            .sum();
        if list_size > self.max_header_list_size.load(Ordering::Acquire) {
            return Err(Error::FrameSize(format!(
                "Header list size {} exceeds peer limit",
                list_size
            )));
        }

        let tuples: Vec<(&[u8], &[u8])> = fields
            .iter()
            .map(|(name, value)| (name.as_bytes(), value.as_bytes()))
            .collect();
        let mut block = Vec::new();
        let mut encoder = self.hpack.lock().unwrap();
        encoder
            .encode_into(tuples, &mut block)
            .map_err(|e| Error::Internal(format!("HPACK encode error: {}", e)))?;
        Ok(block)
    }

    fn encode_headers(&self, frame: &HeadersFrame) -> Result<Bytes> {
        let block = self.encode_fields(&frame.fields)?;

        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::END_HEADERS);
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        let mut payload_len = block.len();
        if frame.priority.is_some() {
            flags.set(FrameFlags::PRIORITY);
            payload_len += 5;
        }

        // Header blocks are not split into CONTINUATION frames; a block
        // that does not fit the frame cap fails the submission.
        if payload_len > self.max_frame_size() as usize {
            return Err(Error::FrameSize(format!(
                "Header block of {} bytes exceeds max frame size {}",
                payload_len,
                self.max_frame_size()
            )));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&encode_frame_header(
            FrameType::Headers,
            flags,
            frame.stream_id,
            payload_len,
        ));
        if let Some(priority) = &frame.priority {
            let mut dep = priority.stream_dependency;
            if priority.exclusive {
                dep |= 0x8000_0000;
            }
            buf.put_u32(dep);
            buf.put_u8(priority.weight);
        }
        buf.put_slice(&block);
        Ok(buf.freeze())
    }

    fn encode_push_promise(&self, frame: &PushPromiseFrame) -> Result<Bytes> {
        let block = self.encode_fields(&frame.fields)?;
        let payload_len = 4 + block.len();
        if payload_len > self.max_frame_size() as usize {
            return Err(Error::FrameSize(format!(
                "Promise block of {} bytes exceeds max frame size {}",
                payload_len,
                self.max_frame_size()
            )));
        }

        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::END_HEADERS);

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&encode_frame_header(
            FrameType::PushPromise,
            flags,
            frame.stream_id,
            payload_len,
        ));
        buf.put_u32(frame.promised_stream_id & 0x7FFF_FFFF);
        buf.put_slice(&block);
        Ok(buf.freeze())
    }
}

impl Default for Generator {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_priority(frame: &PriorityFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 5);
    buf.put_slice(&encode_frame_header(
        FrameType::Priority,
        FrameFlags::empty(),
        frame.stream_id,
        5,
    ));
    let mut dep = frame.priority.stream_dependency;
    if frame.priority.exclusive {
        dep |= 0x8000_0000;
    }
    buf.put_u32(dep);
    buf.put_u8(frame.priority.weight);
    buf.freeze()
}

fn encode_reset(frame: &ResetFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
    buf.put_slice(&encode_frame_header(
        FrameType::RstStream,
        FrameFlags::empty(),
        frame.stream_id,
        4,
    ));
    buf.put_u32(frame.error_code.as_u32());
    buf.freeze()
}

fn encode_settings(frame: &SettingsFrame) -> Bytes {
    let flags = if frame.ack {
        FrameFlags::from_u8(FrameFlags::ACK)
    } else {
        FrameFlags::empty()
    };

    let entries = if frame.ack {
        Vec::new()
    } else {
        frame.settings.to_entries()
    };

    // Each setting is 6 bytes (2 byte ID + 4 byte value); stream ID is 0.
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + entries.len() * 6);
    buf.put_slice(&encode_frame_header(
        FrameType::Settings,
        flags,
        0,
        entries.len() * 6,
    ));
    for (id, value) in entries {
        buf.put_u16(id);
        buf.put_u32(value);
    }
    buf.freeze()
}

fn encode_ping(frame: &PingFrame) -> Bytes {
    let flags = if frame.ack {
        FrameFlags::from_u8(FrameFlags::ACK)
    } else {
        FrameFlags::empty()
    };
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
    buf.put_slice(&encode_frame_header(FrameType::Ping, flags, 0, 8));
    buf.put_slice(&frame.data);
    buf.freeze()
}

fn encode_go_away(frame: &GoAwayFrame) -> Bytes {
    let payload_len = 8 + frame.debug_data.len();
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
    buf.put_slice(&encode_frame_header(
        FrameType::Goaway,
        FrameFlags::empty(),
        0,
        payload_len,
    ));
    buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
    buf.put_u32(frame.error_code.as_u32());
    buf.put_slice(&frame.debug_data);
    buf.freeze()
}

fn encode_window_update(frame: &WindowUpdateFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
    buf.put_slice(&encode_frame_header(
        FrameType::WindowUpdate,
        FrameFlags::empty(),
        frame.stream_id,
        4,
    ));
    buf.put_u32(frame.size_increment & 0x7FFF_FFFF);
    buf.freeze()
}

/// Receiver of decoded frames and protocol violations.
pub trait FrameSink {
    /// A complete frame was decoded.
    fn on_frame(&self, frame: Frame);

    /// A connection-level protocol violation was detected.
    fn on_connection_failure(&self, code: ErrorCode, reason: &str);

    /// A stream-level protocol violation was detected.
    fn on_stream_failure(&self, stream_id: u32, code: ErrorCode, reason: &str);
}

/// Incremental frame parser.
///
/// Feed it transport bytes as they arrive; it buffers partial frames
/// and delivers complete ones in order. After a connection failure the
/// parser stops consuming input.
pub struct Parser {
    buffer: BytesMut,
    preface_remaining: usize,
    max_frame_size: u32,
    hpack: hpack::Decoder<'static>,
    failed: bool,
}

impl Parser {
    /// Parser for the client role: no connection preface expected.
    pub fn new() -> Self {
        Parser {
            buffer: BytesMut::with_capacity(4096),
            preface_remaining: 0,
            max_frame_size: crate::DEFAULT_MAX_FRAME_SIZE,
            hpack: hpack::Decoder::new(),
            failed: false,
        }
    }

    /// Parser for the server role: the client connection preface must
    /// arrive before the first frame (RFC 7540 Section 3.5).
    pub fn with_preface() -> Self {
        let mut parser = Self::new();
        parser.preface_remaining = crate::CONNECTION_PREFACE.len();
        parser
    }

    /// Raise or lower the largest payload this parser accepts.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Consume transport bytes, delivering decoded frames to `sink`.
    pub fn parse<S: FrameSink>(&mut self, data: &[u8], sink: &S) {
        if self.failed {
            return;
        }
        self.buffer.extend_from_slice(data);

        if self.preface_remaining > 0 && !self.consume_preface(sink) {
            return;
        }

        while !self.failed {
            if self.buffer.len() < FRAME_HEADER_SIZE {
                return;
            }
            let (frame_type, flags, stream_id, length) = decode_frame_header(&self.buffer);
            if length > self.max_frame_size as usize {
                self.connection_failure(sink, ErrorCode::FrameSizeError, "invalid_frame_length");
                return;
            }
            if self.buffer.len() < FRAME_HEADER_SIZE + length {
                return;
            }
            let _ = self.buffer.split_to(FRAME_HEADER_SIZE);
            let payload = self.buffer.split_to(length).freeze();
            self.decode_frame(frame_type, flags, stream_id, payload, sink);
        }
    }

    fn consume_preface<S: FrameSink>(&mut self, sink: &S) -> bool {
        let preface = crate::CONNECTION_PREFACE;
        let offset = preface.len() - self.preface_remaining;
        let available = self.buffer.len().min(self.preface_remaining);
        if self.buffer[..available] != preface[offset..offset + available] {
            self.connection_failure(sink, ErrorCode::ProtocolError, "invalid_preface");
            return false;
        }
        let _ = self.buffer.split_to(available);
        self.preface_remaining -= available;
        self.preface_remaining == 0
    }

    fn connection_failure<S: FrameSink>(&mut self, sink: &S, code: ErrorCode, reason: &str) {
        self.failed = true;
        sink.on_connection_failure(code, reason);
    }

    fn decode_frame<S: FrameSink>(
        &mut self,
        frame_type: u8,
        flags: FrameFlags,
        stream_id: u32,
        payload: Bytes,
        sink: &S,
    ) {
        match FrameType::from_u8(frame_type) {
            Some(FrameType::Data) => self.decode_data(flags, stream_id, payload, sink),
            Some(FrameType::Headers) => self.decode_headers(flags, stream_id, payload, sink),
            Some(FrameType::Priority) => self.decode_priority(stream_id, payload, sink),
            Some(FrameType::RstStream) => self.decode_reset(stream_id, payload, sink),
            Some(FrameType::Settings) => self.decode_settings(flags, stream_id, payload, sink),
            Some(FrameType::PushPromise) => {
                self.decode_push_promise(flags, stream_id, payload, sink)
            }
            Some(FrameType::Ping) => self.decode_ping(flags, stream_id, payload, sink),
            Some(FrameType::Goaway) => self.decode_go_away(stream_id, payload, sink),
            Some(FrameType::WindowUpdate) => {
                self.decode_window_update(stream_id, payload, sink)
            }
            // CONTINUATION without HEADERS reassembly, or a type this
            // engine does not know: the session decides.
            Some(FrameType::Continuation) | Some(FrameType::Disconnect) | None => {
                sink.on_frame(Frame::Unknown(frame_type))
            }
        }
    }

    fn decode_data<S: FrameSink>(
        &mut self,
        flags: FrameFlags,
        stream_id: u32,
        payload: Bytes,
        sink: &S,
    ) {
        if stream_id == 0 {
            return self.connection_failure(sink, ErrorCode::ProtocolError, "invalid_data_frame");
        }
        let (data, padding) = match self.strip_padding(flags, payload) {
            Ok(parts) => parts,
            Err(reason) => {
                return self.connection_failure(sink, ErrorCode::ProtocolError, reason)
            }
        };
        let mut frame = DataFrame::new(stream_id, data, flags.is_end_stream());
        frame.padding = padding;
        sink.on_frame(Frame::Data(frame));
    }

    fn decode_headers<S: FrameSink>(
        &mut self,
        flags: FrameFlags,
        stream_id: u32,
        payload: Bytes,
        sink: &S,
    ) {
        if stream_id == 0 {
            return self
                .connection_failure(sink, ErrorCode::ProtocolError, "invalid_headers_frame");
        }
        if !flags.is_end_headers() {
            return self
                .connection_failure(sink, ErrorCode::ProtocolError, "continuation_unsupported");
        }
        let (mut block, _) = match self.strip_padding(flags, payload) {
            Ok(parts) => parts,
            Err(reason) => {
                return self.connection_failure(sink, ErrorCode::ProtocolError, reason)
            }
        };

        let priority = if flags.is_priority() {
            if block.len() < 5 {
                return self
                    .connection_failure(sink, ErrorCode::FrameSizeError, "invalid_headers_frame");
            }
            let raw = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
            let weight = block[4];
            let _ = block.split_to(5);
            Some(PrioritySpec::new(
                raw & 0x7FFF_FFFF,
                raw & 0x8000_0000 != 0,
                weight,
            ))
        } else {
            None
        };

        let fields = match self.decode_fields(&block) {
            Ok(fields) => fields,
            Err(_) => {
                return self
                    .connection_failure(sink, ErrorCode::CompressionError, "hpack_decode_error")
            }
        };

        let mut frame = HeadersFrame::new(stream_id, fields, flags.is_end_stream());
        frame.priority = priority;
        sink.on_frame(Frame::Headers(frame));
    }

    fn decode_priority<S: FrameSink>(&mut self, stream_id: u32, payload: Bytes, sink: &S) {
        if stream_id == 0 {
            return self
                .connection_failure(sink, ErrorCode::ProtocolError, "invalid_priority_frame");
        }
        if payload.len() != 5 {
            return self
                .connection_failure(sink, ErrorCode::FrameSizeError, "invalid_priority_frame");
        }
        let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let spec = PrioritySpec::new(raw & 0x7FFF_FFFF, raw & 0x8000_0000 != 0, payload[4]);
        sink.on_frame(Frame::Priority(PriorityFrame::new(stream_id, spec)));
    }

    fn decode_reset<S: FrameSink>(&mut self, stream_id: u32, payload: Bytes, sink: &S) {
        if stream_id == 0 {
            return self
                .connection_failure(sink, ErrorCode::ProtocolError, "invalid_rst_stream_frame");
        }
        if payload.len() != 4 {
            return self
                .connection_failure(sink, ErrorCode::FrameSizeError, "invalid_rst_stream_frame");
        }
        let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        sink.on_frame(Frame::Reset(ResetFrame::new(
            stream_id,
            ErrorCode::from_wire(code),
        )));
    }

    fn decode_settings<S: FrameSink>(
        &mut self,
        flags: FrameFlags,
        stream_id: u32,
        payload: Bytes,
        sink: &S,
    ) {
        if stream_id != 0 {
            return self
                .connection_failure(sink, ErrorCode::ProtocolError, "invalid_settings_frame");
        }
        if flags.is_ack() {
            if !payload.is_empty() {
                return self.connection_failure(
                    sink,
                    ErrorCode::FrameSizeError,
                    "invalid_settings_ack_frame",
                );
            }
            return sink.on_frame(Frame::Settings(SettingsFrame::ack()));
        }
        if payload.len() % 6 != 0 {
            return self
                .connection_failure(sink, ErrorCode::FrameSizeError, "invalid_settings_frame");
        }
        let mut settings = Settings::new();
        let mut pos = 0;
        while pos + 6 <= payload.len() {
            let id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
            let value = u32::from_be_bytes([
                payload[pos + 2],
                payload[pos + 3],
                payload[pos + 4],
                payload[pos + 5],
            ]);
            settings.apply_entry(id, value);
            pos += 6;
        }
        sink.on_frame(Frame::Settings(SettingsFrame::new(settings)));
    }

    fn decode_push_promise<S: FrameSink>(
        &mut self,
        flags: FrameFlags,
        stream_id: u32,
        payload: Bytes,
        sink: &S,
    ) {
        if stream_id == 0 {
            return self
                .connection_failure(sink, ErrorCode::ProtocolError, "invalid_push_promise_frame");
        }
        if !flags.is_end_headers() {
            return self
                .connection_failure(sink, ErrorCode::ProtocolError, "continuation_unsupported");
        }
        let (mut block, _) = match self.strip_padding(flags, payload) {
            Ok(parts) => parts,
            Err(reason) => {
                return self.connection_failure(sink, ErrorCode::ProtocolError, reason)
            }
        };
        if block.len() < 4 {
            return self.connection_failure(
                sink,
                ErrorCode::FrameSizeError,
                "invalid_push_promise_frame",
            );
        }
        let promised =
            u32::from_be_bytes([block[0], block[1], block[2], block[3]]) & 0x7FFF_FFFF;
        let _ = block.split_to(4);

        let fields = match self.decode_fields(&block) {
            Ok(fields) => fields,
            Err(_) => {
                return self
                    .connection_failure(sink, ErrorCode::CompressionError, "hpack_decode_error")
            }
        };
        sink.on_frame(Frame::PushPromise(PushPromiseFrame::new(
            stream_id, promised, fields,
        )));
    }

    fn decode_ping<S: FrameSink>(
        &mut self,
        flags: FrameFlags,
        stream_id: u32,
        payload: Bytes,
        sink: &S,
    ) {
        if stream_id != 0 {
            return self.connection_failure(sink, ErrorCode::ProtocolError, "invalid_ping_frame");
        }
        if payload.len() != 8 {
            return self.connection_failure(sink, ErrorCode::FrameSizeError, "invalid_ping_frame");
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&payload);
        let frame = if flags.is_ack() {
            PingFrame::ack(data)
        } else {
            PingFrame::new(data)
        };
        sink.on_frame(Frame::Ping(frame));
    }

    fn decode_go_away<S: FrameSink>(&mut self, stream_id: u32, payload: Bytes, sink: &S) {
        if stream_id != 0 {
            return self
                .connection_failure(sink, ErrorCode::ProtocolError, "invalid_go_away_frame");
        }
        if payload.len() < 8 {
            return self
                .connection_failure(sink, ErrorCode::FrameSizeError, "invalid_go_away_frame");
        }
        let last_stream_id =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
        let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let debug_data = payload.slice(8..);
        sink.on_frame(Frame::GoAway(GoAwayFrame::new(
            last_stream_id,
            ErrorCode::from_wire(code),
            debug_data,
        )));
    }

    fn decode_window_update<S: FrameSink>(&mut self, stream_id: u32, payload: Bytes, sink: &S) {
        if payload.len() != 4 {
            return self.connection_failure(
                sink,
                ErrorCode::FrameSizeError,
                "invalid_window_update_frame",
            );
        }
        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
        if increment == 0 {
            // Zero increment: connection error at the session level,
            // stream error otherwise (RFC 7540 Section 6.9).
            if stream_id == 0 {
                return self.connection_failure(
                    sink,
                    ErrorCode::ProtocolError,
                    "invalid_window_update_frame",
                );
            }
            return sink.on_stream_failure(
                stream_id,
                ErrorCode::ProtocolError,
                "invalid_window_update_frame",
            );
        }
        sink.on_frame(Frame::WindowUpdate(WindowUpdateFrame::new(
            stream_id, increment,
        )));
    }

    /// Strip PADDED framing, returning (payload, pad length).
    fn strip_padding(
        &mut self,
        flags: FrameFlags,
        payload: Bytes,
    ) -> std::result::Result<(Bytes, Option<u8>), &'static str> {
        if !flags.is_padded() {
            return Ok((payload, None));
        }
        if payload.is_empty() {
            return Err("invalid_padding_length");
        }
        let pad_len = payload[0] as usize;
        if pad_len + 1 > payload.len() {
            return Err("invalid_padding_length");
        }
        let data = payload.slice(1..payload.len() - pad_len);
        Ok((data, Some(pad_len as u8)))
    }

    fn decode_fields(&mut self, block: &[u8]) -> Result<Vec<HeaderField>> {
        let decoded = self
            .hpack
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))?;
        Ok(decoded
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect())
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Collect {
        frames: RefCell<Vec<Frame>>,
        connection_failures: RefCell<Vec<(ErrorCode, String)>>,
        stream_failures: RefCell<Vec<(u32, ErrorCode, String)>>,
    }

    impl Collect {
        fn new() -> Self {
            Collect {
                frames: RefCell::new(Vec::new()),
                connection_failures: RefCell::new(Vec::new()),
                stream_failures: RefCell::new(Vec::new()),
            }
        }
    }

    impl FrameSink for Collect {
        fn on_frame(&self, frame: Frame) {
            self.frames.borrow_mut().push(frame);
        }

        fn on_connection_failure(&self, code: ErrorCode, reason: &str) {
            self.connection_failures
                .borrow_mut()
                .push((code, reason.to_string()));
        }

        fn on_stream_failure(&self, stream_id: u32, code: ErrorCode, reason: &str) {
            self.stream_failures
                .borrow_mut()
                .push((stream_id, code, reason.to_string()));
        }
    }

    #[test]
    fn test_frame_header_roundtrip() {
        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::END_STREAM);
        flags.set(FrameFlags::END_HEADERS);
        let header = encode_frame_header(FrameType::Headers, flags, 42, 1234);
        let (ty, decoded_flags, id, len) = decode_frame_header(&header);
        assert_eq!(ty, FrameType::Headers.as_u8());
        assert_eq!(decoded_flags.as_u8(), flags.as_u8());
        assert_eq!(id, 42);
        assert_eq!(len, 1234);
    }

    #[test]
    fn test_data_frame_roundtrip() {
        let generator = Generator::new();
        let encoded = generator.data(1, b"Hello", true);

        assert_eq!(&encoded[0..3], &[0, 0, 5]);
        assert_eq!(encoded[3], FrameType::Data.as_u8());
        assert_eq!(encoded[4], FrameFlags::END_STREAM);
        assert_eq!(&encoded[5..9], &[0, 0, 0, 1]);
        assert_eq!(&encoded[9..], b"Hello");

        let mut parser = Parser::new();
        let sink = Collect::new();
        parser.parse(&encoded, &sink);
        let frames = sink.frames.borrow();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Data(f) => {
                assert_eq!(f.stream_id, 1);
                assert_eq!(f.data.as_ref(), b"Hello");
                assert!(f.end_stream);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_headers_roundtrip_via_hpack() {
        let generator = Generator::new();
        let frame = HeadersFrame::new(
            5,
            vec![
                (":method".into(), "GET".into()),
                (":path".into(), "/index".into()),
                ("x-custom".into(), "yes".into()),
            ],
            true,
        );
        let encoded = generator.control(&Frame::Headers(frame)).unwrap();

        let mut parser = Parser::new();
        let sink = Collect::new();
        parser.parse(&encoded, &sink);
        let frames = sink.frames.borrow();
        match &frames[0] {
            Frame::Headers(f) => {
                assert_eq!(f.stream_id, 5);
                assert!(f.end_stream);
                assert_eq!(f.fields[0], (":method".to_string(), "GET".to_string()));
                assert_eq!(f.fields[2], ("x-custom".to_string(), "yes".to_string()));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_settings_roundtrip() {
        let generator = Generator::new();
        let settings = crate::settings::SettingsBuilder::new()
            .initial_window_size(131_070)
            .max_frame_size(32_768)
            .build()
            .unwrap();
        let encoded = generator
            .control(&Frame::Settings(SettingsFrame::new(settings)))
            .unwrap();
        assert_eq!(&encoded[0..3], &[0, 0, 12]); // 2 entries * 6 bytes
        assert_eq!(&encoded[5..9], &[0, 0, 0, 0]); // stream id 0

        let mut parser = Parser::new();
        let sink = Collect::new();
        parser.parse(&encoded, &sink);
        let frames = sink.frames.borrow();
        match &frames[0] {
            Frame::Settings(f) => {
                assert!(!f.ack);
                assert_eq!(f.settings.initial_window_size, Some(131_070));
                assert_eq!(f.settings.max_frame_size, Some(32_768));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_settings_ack_has_empty_payload() {
        let generator = Generator::new();
        let encoded = generator
            .control(&Frame::Settings(SettingsFrame::ack()))
            .unwrap();
        assert_eq!(&encoded[0..3], &[0, 0, 0]);
        assert_eq!(encoded[4], FrameFlags::ACK);
    }

    #[test]
    fn test_go_away_roundtrip() {
        let generator = Generator::new();
        let frame = GoAwayFrame::with_reason(7, ErrorCode::ProtocolError, "bad_peer");
        let encoded = generator.control(&Frame::GoAway(frame)).unwrap();

        let mut parser = Parser::new();
        let sink = Collect::new();
        parser.parse(&encoded, &sink);
        let frames = sink.frames.borrow();
        match &frames[0] {
            Frame::GoAway(f) => {
                assert_eq!(f.last_stream_id, 7);
                assert_eq!(f.error_code, ErrorCode::ProtocolError);
                assert_eq!(f.reason(), "bad_peer");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_incremental_parse_across_reads() {
        let generator = Generator::new();
        let encoded = generator.data(3, &[7u8; 64], false);

        let mut parser = Parser::new();
        let sink = Collect::new();
        for chunk in encoded.chunks(5) {
            parser.parse(chunk, &sink);
        }
        let frames = sink.frames.borrow();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id(), 3);
    }

    #[test]
    fn test_oversized_frame_is_connection_error() {
        let mut header = encode_frame_header(FrameType::Data, FrameFlags::empty(), 1, 0);
        // Claim a 1MB payload, over the 16384 default cap.
        header[0] = 0x10;
        header[1] = 0;
        header[2] = 0;

        let mut parser = Parser::new();
        let sink = Collect::new();
        parser.parse(&header, &sink);
        let failures = sink.connection_failures.borrow();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ErrorCode::FrameSizeError);

        // Input after the failure is discarded.
        drop(failures);
        parser.parse(&[0u8; 32], &sink);
        assert_eq!(sink.connection_failures.borrow().len(), 1);
    }

    #[test]
    fn test_preface_required_then_frames() {
        let generator = Generator::new();
        let ping = generator
            .control(&Frame::Ping(PingFrame::new([1; 8])))
            .unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(crate::CONNECTION_PREFACE);
        bytes.extend_from_slice(&ping);

        let mut parser = Parser::with_preface();
        let sink = Collect::new();
        // Feed in two chunks splitting inside the preface.
        parser.parse(&bytes[..10], &sink);
        assert!(sink.frames.borrow().is_empty());
        parser.parse(&bytes[10..], &sink);
        assert_eq!(sink.frames.borrow().len(), 1);
    }

    #[test]
    fn test_bad_preface_rejected() {
        let mut parser = Parser::with_preface();
        let sink = Collect::new();
        parser.parse(b"GET / HTTP/1.1\r\n", &sink);
        let failures = sink.connection_failures.borrow();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ErrorCode::ProtocolError);
        assert_eq!(failures[0].1, "invalid_preface");
    }

    #[test]
    fn test_zero_window_increment() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_frame_header(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            5,
            4,
        ));
        buf.extend_from_slice(&0u32.to_be_bytes());

        let mut parser = Parser::new();
        let sink = Collect::new();
        parser.parse(&buf, &sink);
        let failures = sink.stream_failures.borrow();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 5);
        assert_eq!(failures[0].1, ErrorCode::ProtocolError);
    }

    #[test]
    fn test_padded_data_frame() {
        let mut payload = Vec::new();
        payload.push(10u8); // pad length
        payload.extend_from_slice(&[9u8; 100]);
        payload.extend_from_slice(&[0u8; 10]);

        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_frame_header(
            FrameType::Data,
            FrameFlags::from_u8(FrameFlags::PADDED),
            1,
            payload.len(),
        ));
        buf.extend_from_slice(&payload);

        let mut parser = Parser::new();
        let sink = Collect::new();
        parser.parse(&buf, &sink);
        let frames = sink.frames.borrow();
        match &frames[0] {
            Frame::Data(f) => {
                assert_eq!(f.data.len(), 100);
                assert_eq!(f.padding, Some(10));
                assert_eq!(f.flow_control_length(), 110);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_frame_type_surfaces() {
        let mut buf = Vec::new();
        let mut header = encode_frame_header(FrameType::Data, FrameFlags::empty(), 0, 0);
        header[3] = 0x20; // unassigned type
        buf.extend_from_slice(&header);

        let mut parser = Parser::new();
        let sink = Collect::new();
        parser.parse(&buf, &sink);
        let frames = sink.frames.borrow();
        match frames[0] {
            Frame::Unknown(ty) => assert_eq!(ty, 0x20),
            ref other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_header_block_must_fit_frame_cap() {
        let generator = Generator::new();
        generator.set_max_frame_size(16_384);
        let big = "v".repeat(32_000);
        let frame = HeadersFrame::new(1, vec![("x-big".into(), big)], false);
        let result = generator.control(&Frame::Headers(frame));
        assert!(matches!(result, Err(Error::FrameSize(_))));
    }
}
