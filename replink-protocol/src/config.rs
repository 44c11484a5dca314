//! Controller configuration

use crate::read_loop::DEFAULT_STOP_GRACE;
use crate::recovery::{ReconnectionStrategy, RestartPolicy};
use crate::transport::DEFAULT_CONNECT_TIMEOUT;
use crate::{ReplError, Result};
use std::time::Duration;

/// Port the on-device REPL listens on
pub const DEFAULT_REPL_PORT: u16 = 9999;

/// How long to wait for the first byte from a fresh connection
pub const DEFAULT_GREETING_TIMEOUT: Duration = Duration::from_secs(10);

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Host the forwarded port is reachable on
    pub host: String,
    /// Local end of the port forward
    pub local_port: u16,
    /// REPL port on the device
    pub remote_port: u16,
    /// Timeout for opening the TCP connection
    pub connect_timeout: Duration,
    /// Wait for the first inbound byte before declaring a channel up
    ///
    /// A forwarded port accepts connections even when nothing listens on the
    /// device, so the first byte is the only proof the REPL is there.
    pub probe_greeting: bool,
    /// Timeout for the greeting probe
    pub greeting_timeout: Duration,
    /// Grace period for a read loop to observe its stop request
    pub stop_grace: Duration,
    /// Backoff ladder used after a bridge restart
    pub backoff: ReconnectionStrategy,
    /// Polling while the application restarts
    pub restart: RestartPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            local_port: DEFAULT_REPL_PORT,
            remote_port: DEFAULT_REPL_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            probe_greeting: true,
            greeting_timeout: DEFAULT_GREETING_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            backoff: ReconnectionStrategy::default(),
            restart: RestartPolicy::default(),
        }
    }
}

impl ControllerConfig {
    /// Worst-case time a single recovering send can take, excluding the
    /// lifecycle operations themselves
    pub fn worst_case_ladder(&self) -> Duration {
        self.restart.max_wait() + self.backoff.total_remaining()
    }

    /// Reject settings the recovery ladder cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Configuration`] naming the first bad setting.
    pub fn validate(&self) -> Result<()> {
        if self.local_port == 0 || self.remote_port == 0 {
            return Err(ReplError::Configuration(
                "ports must be non-zero".to_string(),
            ));
        }
        if self.restart.max_polls == 0 {
            return Err(ReplError::Configuration(
                "restart poll count must be at least 1".to_string(),
            ));
        }
        if self.backoff.max_delay < self.backoff.initial_delay {
            return Err(ReplError::Configuration(format!(
                "max delay ({:?}) is smaller than initial delay ({:?})",
                self.backoff.max_delay, self.backoff.initial_delay
            )));
        }
        Ok(())
    }
}
