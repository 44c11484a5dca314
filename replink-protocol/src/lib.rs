//! Replink Protocol Implementation
//!
//! This library keeps a reliable, newline-delimited text channel to a REPL
//! application running on an Android device or emulator, reached through a
//! port forwarded by the device bridge. When the channel breaks it recovers
//! by reinstalling and restarting the application, restarting the bridge and
//! reconnecting with exponential backoff.

pub mod adb;
pub mod config;
pub mod controller;
pub mod lifecycle;
pub mod read_loop;
pub mod recovery;
pub mod registry;
pub mod sink;
pub mod transport;

mod error;

pub use adb::{
    AdbConfig, AdbDevice, AdbLifecycle, DeviceChanges, DeviceSource, DeviceWatcher,
    DEFAULT_WATCH_INTERVAL,
};
pub use config::{ControllerConfig, DEFAULT_GREETING_TIMEOUT, DEFAULT_REPL_PORT};
pub use controller::{EscalationStep, RecoveryState, ReplController};
pub use error::{ReplError, Result};
pub use lifecycle::DeviceLifecycle;
pub use read_loop::{ReadLoop, READ_BUFFER_SIZE};
pub use recovery::{ReconnectionStrategy, RestartPolicy};
pub use registry::{Detach, DeviceRegistry};
pub use sink::{ChannelSink, ReplEvent, Sink};
pub use transport::{
    TcpConnection, TcpTransportFactory, Transport, TransportFactory, TransportReader,
    DEFAULT_CONNECT_TIMEOUT, LINE_TERMINATOR,
};

#[cfg(test)]
pub mod test_utils;
