//! Transport abstraction.
//!
//! The session engine never touches sockets directly: it writes frames
//! through the [`Endpoint`] trait and is fed decoded frames by the
//! layer that reads from the transport. [`TcpEndpoint`] adapts a plain
//! `TcpStream`; TLS or in-memory transports implement the same trait.

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One reliable byte transport, write side.
pub trait Endpoint: Send + Sync {
    /// Write the whole buffer.
    fn write(&self, buf: &[u8]) -> io::Result<()>;

    /// Shut down the output direction only; reads continue.
    fn shutdown_output(&self) -> io::Result<()>;

    /// Close the transport in both directions.
    fn close(&self);

    /// Whether the transport is still open.
    fn is_open(&self) -> bool;

    /// Idle timeout configured for this transport.
    fn idle_timeout(&self) -> Duration;
}

/// [`Endpoint`] over a `TcpStream`.
pub struct TcpEndpoint {
    stream: Mutex<TcpStream>,
    open: AtomicBool,
    idle_timeout: Duration,
}

impl TcpEndpoint {
    /// Wrap a connected stream with a 30 second idle timeout.
    pub fn new(stream: TcpStream) -> Self {
        Self::with_idle_timeout(stream, Duration::from_secs(30))
    }

    /// Wrap a connected stream with the given idle timeout.
    pub fn with_idle_timeout(stream: TcpStream, idle_timeout: Duration) -> Self {
        TcpEndpoint {
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
            idle_timeout,
        }
    }
}

impl Endpoint for TcpEndpoint {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock().unwrap();
        stream.write_all(buf)?;
        stream.flush()
    }

    fn shutdown_output(&self) -> io::Result<()> {
        let stream = self.stream.lock().unwrap();
        stream.shutdown(Shutdown::Write)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let stream = self.stream.lock().unwrap();
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Endpoint for unit tests: swallows writes and records the
    /// open/shutdown flags.
    pub(crate) struct SinkEndpoint {
        written: Mutex<Vec<u8>>,
        output_shutdown: AtomicBool,
        open: AtomicBool,
        idle_timeout: Duration,
    }

    impl SinkEndpoint {
        pub(crate) fn new() -> Self {
            SinkEndpoint {
                written: Mutex::new(Vec::new()),
                output_shutdown: AtomicBool::new(false),
                open: AtomicBool::new(true),
                idle_timeout: Duration::from_secs(30),
            }
        }
    }

    impl Endpoint for SinkEndpoint {
        fn write(&self, buf: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        fn shutdown_output(&self) -> io::Result<()> {
            self.output_shutdown.store(true, Ordering::Release);
            Ok(())
        }

        fn close(&self) {
            self.open.store(false, Ordering::Release);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        fn idle_timeout(&self) -> Duration {
            self.idle_timeout
        }
    }
}
