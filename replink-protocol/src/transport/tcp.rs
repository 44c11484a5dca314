//! TCP Transport
//!
//! Plain TCP connection to the locally forwarded REPL port.

use super::r#trait::{Transport, TransportFactory, TransportReader, LINE_TERMINATOR};
use crate::{ReplError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Default timeout for opening a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP connection to the device REPL
#[derive(Debug)]
pub struct TcpConnection {
    writer: Option<OwnedWriteHalf>,
    reader: Option<OwnedReadHalf>,
    remote_addr: String,
}

impl TcpConnection {
    /// Connect to `host:port`
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let remote_addr = format!("{}:{}", host, port);
        debug!("Connecting to {}", remote_addr);

        let stream = timeout(connect_timeout, TcpStream::connect(remote_addr.as_str()))
            .await
            .map_err(|_| ReplError::Connect(format!("connection to {} timed out", remote_addr)))?
            .map_err(|e| ReplError::Connect(format!("{}: {}", remote_addr, e)))?;

        debug!("Connected to {}", remote_addr);
        Ok(Self::from_stream(stream, remote_addr))
    }

    /// Create from an existing TcpStream
    pub fn from_stream(stream: TcpStream, remote_addr: String) -> Self {
        // Lines are small and latency matters more than throughput
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            writer: Some(writer),
            reader: Some(reader),
            remote_addr,
        }
    }
}

#[async_trait]
impl Transport for TcpConnection {
    fn remote_address(&self) -> String {
        self.remote_addr.clone()
    }

    async fn write_line(&mut self, message: &str) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            ReplError::Io(std::io::Error::new(
                ErrorKind::NotConnected,
                "Connection closed",
            ))
        })?;

        writer.write_all(message.as_bytes()).await?;
        writer.write_all(&[LINE_TERMINATOR]).await?;
        writer.flush().await?;

        debug!("Sent '{}' to {}", message, self.remote_addr);
        Ok(())
    }

    fn take_reader(&mut self) -> Option<Box<dyn TransportReader>> {
        self.reader
            .take()
            .map(|reader| Box::new(TcpReader { reader }) as Box<dyn TransportReader>)
    }

    async fn close(&mut self) -> Result<()> {
        // An untaken reader is dropped here; a taken one closes with its read loop
        self.reader = None;
        if let Some(mut writer) = self.writer.take() {
            debug!("Closing connection to {}", self.remote_addr);
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.remote_addr, e);
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

/// Inbound half of a [`TcpConnection`]
#[derive(Debug)]
pub struct TcpReader {
    reader: OwnedReadHalf,
}

#[async_trait]
impl TransportReader for TcpReader {
    async fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte).await? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.reader.try_read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Factory for [`TcpConnection`]s
#[derive(Debug, Clone)]
pub struct TcpTransportFactory {
    connect_timeout: Duration,
}

impl TcpTransportFactory {
    /// Create a factory with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransportFactory {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Transport>> {
        let connection = TcpConnection::connect(host, port, self.connect_timeout).await?;
        Ok(Box::new(connection))
    }
}
