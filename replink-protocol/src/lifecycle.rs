//! Device Lifecycle
//!
//! Interface to whatever installs, starts and stops the REPL application on
//! the device and maintains the port forward to it. The controller holds a
//! shared reference and never owns the device side.

use crate::Result;
use async_trait::async_trait;

/// Device and application management used by the recovery ladder
#[async_trait]
pub trait DeviceLifecycle: Send + Sync {
    /// Device currently targeted for communication, if any
    async fn selected_device(&self) -> Option<String>;

    /// Target `device_id` for communication
    ///
    /// # Errors
    ///
    /// Returns [`crate::ReplError::DeviceSelection`] if the device is unknown.
    async fn select_device(&self, device_id: &str) -> Result<()>;

    /// Sync and reinstall the REPL application on the selected device
    async fn reinstall_application(&self) -> Result<()>;

    /// Stop the REPL application
    async fn kill_application(&self) -> Result<()>;

    /// Launch the REPL application
    async fn start_application(&self) -> Result<()>;

    /// Best-effort check that the application process is running
    ///
    /// A running process is not necessarily listening yet.
    async fn is_application_running(&self) -> bool;

    /// Forward `local_port` on this host to `remote_port` on the device
    async fn forward_port(&self, local_port: u16, remote_port: u16) -> bool;

    /// Restart the device bridge (may be slow)
    async fn restart_bridge(&self);
}

