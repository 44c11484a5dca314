//! REPL Transport Layer
//!
//! The transport layer carries newline-terminated UTF-8 lines to the device
//! REPL and hands the inbound byte stream to the read loop. Implementations
//! plug in through a common trait interface so the recovery logic can be
//! exercised without a device.

mod r#trait;
pub mod tcp;

pub use r#trait::{Transport, TransportFactory, TransportReader, LINE_TERMINATOR};
pub use tcp::{TcpConnection, TcpReader, TcpTransportFactory, DEFAULT_CONNECT_TIMEOUT};
