//! Recovery Policies
//!
//! Timing policies used by the escalation ladder:
//! - Exponential backoff between reconnection attempts after a bridge restart
//! - Bounded polling while the REPL application restarts

use std::time::Duration;

/// Number of backoff attempts after a bridge restart
const MAX_RECONNECT_ATTEMPTS: u32 = 4;

/// Delay before the first backoff attempt
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Maximum delay between attempts
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(24);

/// Interval between "is the application running" checks
const RESTART_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Number of running checks before giving up optimistically
const RESTART_POLL_ATTEMPTS: u32 = 10;

/// Reconnection strategy with exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionStrategy {
    /// Current reconnection attempt number
    pub attempt: u32,
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Current delay between attempts
    pub current_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for ReconnectionStrategy {
    fn default() -> Self {
        Self::with_limits(
            INITIAL_RECONNECT_DELAY,
            MAX_RECONNECT_ATTEMPTS,
            MAX_RECONNECT_DELAY,
        )
    }
}

impl ReconnectionStrategy {
    /// Create the default 3s/6s/12s/24s strategy
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a strategy with custom limits
    pub fn with_limits(initial_delay: Duration, max_attempts: u32, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            initial_delay,
            current_delay: initial_delay,
            max_delay,
        }
    }

    /// Reset the strategy
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay;
    }

    /// Check if more attempts are available
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Get next delay with exponential backoff
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_attempts_remaining() {
            return None;
        }

        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = std::cmp::min(self.current_delay * 2, self.max_delay);

        Some(delay)
    }

    /// Sum of every remaining delay
    pub fn total_remaining(&self) -> Duration {
        let mut probe = self.clone();
        let mut total = Duration::ZERO;
        while let Some(delay) = probe.next_delay() {
            total += delay;
        }
        total
    }

    /// Get human-readable status
    pub fn status(&self) -> String {
        format!(
            "Attempt {}/{}, next delay: {:?}",
            self.attempt, self.max_attempts, self.current_delay
        )
    }
}

/// Polling schedule used while waiting for a restarted application
///
/// Running out of polls is not a failure: the process check can report
/// false negatives, so the write that follows is the real confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay before each running check
    pub poll_interval: Duration,
    /// Number of checks
    pub max_polls: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            poll_interval: RESTART_POLL_INTERVAL,
            max_polls: RESTART_POLL_ATTEMPTS,
        }
    }
}

impl RestartPolicy {
    /// Longest time a restart can spend polling
    pub fn max_wait(&self) -> Duration {
        self.poll_interval * self.max_polls
    }
}
