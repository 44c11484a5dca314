//! Error handling for the REPL channel
//!
//! This module provides the single error type used by every controller
//! operation. Errors are automatically converted from `std::io::Error` using
//! `thiserror`.
//!
//! ## Error Categories
//!
//! ### Transient
//! Failures the recovery ladder can fix by reinstalling, restarting or
//! reconnecting: `Connect`, `Io`, `ChannelUnhappy`, `Timeout`.
//!
//! ### Fatal preconditions
//! Configuration problems no amount of retrying fixes:
//! `NoDeviceSelected`, `NoDevicesAttached`, `DeviceSelection`,
//! `Configuration`.
//!
//! ### Escalation outcomes
//! `Remediation` (reinstall/restart failed), `PortForward` and
//! `LadderExhausted` (every backoff attempt failed).
//!
//! ## Logging Errors
//!
//! ```rust,ignore
//! use tracing::warn;
//!
//! if let Err(e) = controller.send_with_recovery("(+ 1 2)", false).await {
//!     warn!("Send failed: {}", e.user_message());
//! }
//! ```

use thiserror::Error;

/// Result type for REPL channel operations
///
/// # Examples
///
/// ```rust
/// use replink_protocol::Result;
///
/// fn example() -> Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, ReplError>;

/// Errors that can occur while talking to the on-device REPL
///
/// # Examples
///
/// ```rust
/// use replink_protocol::ReplError;
///
/// let error = ReplError::NoDeviceSelected;
/// assert_eq!(error.to_string(), "It appears that no device has been selected");
///
/// let error = ReplError::Remediation("install failed".to_string());
/// assert_eq!(error.to_string(), "Failed to restart application: install failed");
/// ```
#[derive(Error, Debug)]
pub enum ReplError {
    /// I/O error on an open transport
    ///
    /// Automatically converted from `std::io::Error`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket could not be opened, or nothing answered on it
    #[error("Connect error: {0}")]
    Connect(String),

    /// A fast send was attempted while the channel is not known to be writable
    #[error("Connection is not happy and needs restart")]
    ChannelUnhappy,

    /// No device is selected as the communication target
    #[error("It appears that no device has been selected")]
    NoDeviceSelected,

    /// No devices are attached at all
    #[error("Cannot find any connected devices")]
    NoDevicesAttached,

    /// Reinstalling or restarting the on-device application failed
    #[error("Failed to restart application: {0}")]
    Remediation(String),

    /// The port forward through the device bridge could not be established
    #[error("Could not forward TCP port {local} to device port {remote}")]
    PortForward {
        /// Local port
        local: u16,
        /// Port on the device
        remote: u16,
    },

    /// Every backoff attempt failed; carries the last attempt's error text
    #[error("Gave up connecting to device: {0}")]
    LadderExhausted(String),

    /// The device lifecycle manager rejected a selection
    #[error("Cannot select device {device_id}: {reason}")]
    DeviceSelection {
        /// Requested device
        device_id: String,
        /// Why the selection was rejected
        reason: String,
    },

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ReplError {
    /// Convert an I/O error into a more specific variant where possible
    ///
    /// # Examples
    ///
    /// ```rust
    /// use replink_protocol::ReplError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "read timeout");
    /// let error = ReplError::from_io_error(io_error, "waiting for greeting");
    ///
    /// assert!(matches!(error, ReplError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ReplError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused
            | ErrorKind::NetworkUnreachable
            | ErrorKind::AddrNotAvailable => ReplError::Connect(format!("{}: {}", context, error)),
            _ => ReplError::Io(error),
        }
    }

    /// Check if the recovery ladder may fix this error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use replink_protocol::ReplError;
    ///
    /// assert!(ReplError::ChannelUnhappy.is_recoverable());
    /// assert!(!ReplError::NoDevicesAttached.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReplError::Io(_)
                | ReplError::Connect(_)
                | ReplError::ChannelUnhappy
                | ReplError::Timeout(_)
                | ReplError::PortForward { .. }
        )
    }

    /// Check if this error needs the user to change something first
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ReplError::NoDeviceSelected
                | ReplError::NoDevicesAttached
                | ReplError::DeviceSelection { .. }
                | ReplError::Configuration(_)
        )
    }

    /// Single-line, human-readable explanation suitable for a status bar
    pub fn user_message(&self) -> String {
        let message = match self {
            ReplError::NoDeviceSelected => {
                "No device selected. Pick a phone or emulator first.".to_string()
            }
            ReplError::NoDevicesAttached => {
                "Cannot find any connected devices. Plug in a phone or start an emulator."
                    .to_string()
            }
            ReplError::ChannelUnhappy => {
                "Connection to the device needs to be restarted.".to_string()
            }
            ReplError::Remediation(msg) => {
                format!("Could not restart the app on the device: {}.", msg)
            }
            ReplError::PortForward { local, remote } => format!(
                "Could not forward port {} to the device ({}). Check the device bridge.",
                local, remote
            ),
            ReplError::LadderExhausted(msg) => {
                format!("Gave up connecting to the device: {}.", msg)
            }
            ReplError::DeviceSelection { device_id, reason } => {
                format!("Cannot use device '{}': {}.", device_id, reason)
            }
            ReplError::Connect(msg) => format!("Cannot connect to the device: {}.", msg),
            ReplError::Timeout(msg) => format!("Timed out: {}.", msg),
            ReplError::Io(e) => format!("I/O error: {}.", e),
            ReplError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
        };
        // Failure text coming from adb may span several lines
        message.lines().collect::<Vec<_>>().join(" ")
    }
}
