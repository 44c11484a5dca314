//! Device Registry
//!
//! Counts attached devices. Only attach/detach notifications pushed in by the
//! device lifecycle manager change the count; the controller never resets it.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Outcome of a detach notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detach {
    /// Attached count after the detach
    pub attached: usize,
    /// The count would have gone negative and was clamped at zero
    pub underflow: bool,
}

/// Attached-device counter
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    attached: AtomicUsize,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attached devices
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    /// Record an attach, returning the new count
    pub fn device_attached(&self, device_id: &str) -> usize {
        let attached = self.attached.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Device {} attached: {} devices attached", device_id, attached);
        attached
    }

    /// Record a detach; the count never goes below zero
    pub fn device_detached(&self, device_id: &str) -> Detach {
        let previous = self
            .attached
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or(0);

        if previous == 0 {
            warn!(
                "Device {} detached while no devices were attached, keeping count at 0",
                device_id
            );
            return Detach {
                attached: 0,
                underflow: true,
            };
        }

        let attached = previous - 1;
        debug!("Device {} detached: {} devices attached", device_id, attached);
        Detach {
            attached,
            underflow: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_detach_counts() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.attached(), 0);

        assert_eq!(registry.device_attached("a"), 1);
        assert_eq!(registry.device_attached("b"), 2);
        assert_eq!(
            registry.device_detached("a"),
            Detach {
                attached: 1,
                underflow: false
            }
        );
        assert_eq!(registry.attached(), 1);
    }

    #[test]
    fn test_detach_clamps_at_zero() {
        let registry = DeviceRegistry::new();

        let detach = registry.device_detached("ghost");
        assert!(detach.underflow);
        assert_eq!(detach.attached, 0);
        assert_eq!(registry.attached(), 0);

        registry.device_attached("a");
        assert_eq!(registry.attached(), 1);
    }

    #[test]
    fn test_count_never_negative_for_any_sequence() {
        let registry = DeviceRegistry::new();
        let mut model: i64 = 0;

        // Deterministic pseudo-random walk over attach/detach
        let mut seed: u32 = 0x2545_f491;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 {
                registry.device_attached("d");
                model += 1;
            } else {
                registry.device_detached("d");
                model = (model - 1).max(0);
            }
            assert_eq!(registry.attached() as i64, model);
        }
    }
}
