//! Transport Trait Abstraction
//!
//! Defines the interface for the duplex byte connection to the device REPL.
//! The outbound side writes newline-terminated UTF-8 lines; the inbound side
//! is handed to exactly one read loop.

use crate::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Line terminator appended to every outbound message
pub const LINE_TERMINATOR: u8 = b'\n';

/// One live duplex connection to the device REPL
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Human-readable remote address (for logging)
    fn remote_address(&self) -> String;

    /// Write `message` followed by a single newline
    ///
    /// No other framing is applied. Embedded newlines are sent as-is and
    /// will be seen as separate lines by the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    async fn write_line(&mut self, message: &str) -> Result<()>;

    /// Hand out the inbound half of the connection
    ///
    /// Returns `None` once the reader has already been taken.
    fn take_reader(&mut self) -> Option<Box<dyn TransportReader>>;

    /// Close the connection
    ///
    /// Idempotent: closing an already-closed transport is not an error.
    async fn close(&mut self) -> Result<()>;

    /// Check if the transport is still open
    fn is_open(&self) -> bool;
}

/// Inbound half of a transport, owned by the read loop
#[async_trait]
pub trait TransportReader: Send + Debug {
    /// Wait for one byte
    ///
    /// Returns `Ok(None)` on end-of-stream.
    async fn read_byte(&mut self) -> Result<Option<u8>>;

    /// Copy already-buffered bytes into `buf` without waiting
    ///
    /// Returns the number of bytes copied, `0` if nothing is buffered.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Factory trait for opening transports
#[async_trait]
pub trait TransportFactory: Send + Sync + Debug {
    /// Open a connection to `host:port`
    ///
    /// Success does not prove anything is listening on the far end: a
    /// forwarded port accepts connections even when the device app is down.
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Transport>>;
}
