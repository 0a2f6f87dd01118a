//! h2mux - an embeddable HTTP/2 session engine
//!
//! This crate implements the connection-level state machine of RFC
//! 7540: stream multiplexing, per-stream and per-session flow control,
//! the graceful-shutdown protocol and an ordered, single-writer
//! outbound frame flusher. It does not open sockets or negotiate TLS;
//! the transport is pluggable through the [`endpoint::Endpoint`] trait
//! and decoded frames are fed in through [`codec::Parser`].
//!
//! # Architecture
//!
//! - [`session::Session`] owns the stream registry, the session
//!   windows and the close state machine, and dispatches every inbound
//!   frame.
//! - [`stream::Stream`] tracks one multiplexed channel: its two flow
//!   control windows, the close state of each half, and an idle
//!   deadline.
//! - The flusher (internal) is the sole writer to the transport and
//!   the sole mutator of send windows; it slices DATA frames to the
//!   available windows and prepends PING frames ahead of the backlog.
//! - [`flow_control`] supplies the replenishment policy: immediate
//!   ([`flow_control::SimpleFlowControl`]) or batched
//!   ([`flow_control::BufferingFlowControl`]).
//!
//! # Example
//!
//! ```no_run
//! use h2mux::callback::Callback;
//! use h2mux::codec::Parser;
//! use h2mux::endpoint::TcpEndpoint;
//! use h2mux::frames::HeadersFrame;
//! use h2mux::session::SessionBuilder;
//! use std::io::Read;
//! use std::net::TcpStream;
//! use std::sync::Arc;
//!
//! # fn main() -> std::io::Result<()> {
//! let tcp = TcpStream::connect("example.com:80")?;
//! let mut read_side = tcp.try_clone()?;
//! let endpoint = Arc::new(TcpEndpoint::new(tcp));
//!
//! let session = SessionBuilder::client().build(endpoint);
//!
//! // The client emits the connection preface before any frame.
//! session.endpoint_write(h2mux::CONNECTION_PREFACE)?;
//!
//! let headers = HeadersFrame::new(
//!     0, // id assigned on submission
//!     vec![
//!         (":method".into(), "GET".into()),
//!         (":scheme".into(), "http".into()),
//!         (":authority".into(), "example.com".into()),
//!         (":path".into(), "/".into()),
//!     ],
//!     true,
//! );
//! let stream = session
//!     .new_stream(headers, Arc::new(()), Callback::noop())
//!     .unwrap();
//! assert_eq!(stream.id(), 1);
//!
//! // Read loop: feed transport bytes to the parser.
//! let mut parser = Parser::new();
//! let mut buf = [0u8; 4096];
//! loop {
//!     match read_side.read(&mut buf) {
//!         Ok(0) => {
//!             session.on_shutdown();
//!             break;
//!         }
//!         Ok(n) => parser.parse(&buf[..n], &session),
//!         Err(_) => {
//!             session.on_shutdown();
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod flow_control;
mod flusher;
pub mod frames;
pub mod listener;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod stream;

pub use callback::{Callback, Invocation};
pub use error::{Error, ErrorCode, Result};
pub use flow_control::{BufferingFlowControl, FlowControl, SimpleFlowControl};
pub use frames::{
    DataFrame, Frame, FrameFlags, FrameType, GoAwayFrame, HeadersFrame, PingFrame, PriorityFrame,
    PrioritySpec, PushPromiseFrame, ResetFrame, SettingsFrame, WindowUpdateFrame,
};
pub use listener::{ClientPolicy, ServerPolicy, SessionListener, StreamListener, StreamPolicy};
pub use session::{CloseState, Consumed, Session, SessionBuilder};
pub use settings::{Settings, SettingsBuilder, SettingsParameter};
pub use stream::Stream;

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Largest value SETTINGS_MAX_FRAME_SIZE may take (2^24 - 1)
pub const MAX_FRAME_SIZE_LIMIT: u32 = 16_777_215;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;
