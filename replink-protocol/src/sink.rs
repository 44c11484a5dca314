//! Sink
//!
//! The consumer of inbound REPL text and device lifecycle notifications.
//! Callbacks may run on the read loop task at any time after the controller
//! is constructed, so implementations must be cheap and non-blocking.

use crate::ReplError;
use tokio::sync::mpsc;

/// Receiver of inbound messages and lifecycle events
pub trait Sink: Send + Sync {
    /// Text received from the device REPL
    fn on_message(&self, text: String);

    /// The read loop hit an I/O error it did not cause itself
    fn on_unrecoverable_failure(&self, error: &ReplError);

    /// A device was detached (selected or not)
    fn on_device_disconnected(&self, device_id: &str);

    /// A device was attached
    fn on_device_connected(&self, device_id: &str);
}

/// Event emitted by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplEvent {
    /// Text received from the device REPL
    Message(String),

    /// The read loop failed
    Failure {
        /// Error message
        message: String,
    },

    /// A device was detached
    DeviceDisconnected {
        /// Device ID
        device_id: String,
    },

    /// A device was attached
    DeviceConnected {
        /// Device ID
        device_id: String,
    },
}

/// Sink that forwards every callback as a [`ReplEvent`] on an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    event_tx: mpsc::UnboundedSender<ReplEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReplEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { event_tx }, event_rx)
    }

    fn emit(&self, event: ReplEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.event_tx.send(event);
    }
}

impl Sink for ChannelSink {
    fn on_message(&self, text: String) {
        self.emit(ReplEvent::Message(text));
    }

    fn on_unrecoverable_failure(&self, error: &ReplError) {
        self.emit(ReplEvent::Failure {
            message: error.to_string(),
        });
    }

    fn on_device_disconnected(&self, device_id: &str) {
        self.emit(ReplEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
        });
    }

    fn on_device_connected(&self, device_id: &str) {
        self.emit(ReplEvent::DeviceConnected {
            device_id: device_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards_events() {
        let (sink, mut event_rx) = ChannelSink::new();

        sink.on_device_connected("emulator-5554");
        sink.on_message("=> 3\n".to_string());
        sink.on_unrecoverable_failure(&ReplError::ChannelUnhappy);
        sink.on_device_disconnected("emulator-5554");

        assert_eq!(
            event_rx.recv().await,
            Some(ReplEvent::DeviceConnected {
                device_id: "emulator-5554".to_string()
            })
        );
        assert_eq!(
            event_rx.recv().await,
            Some(ReplEvent::Message("=> 3\n".to_string()))
        );
        assert!(matches!(
            event_rx.recv().await,
            Some(ReplEvent::Failure { message }) if message.contains("not happy")
        ));
        assert_eq!(
            event_rx.recv().await,
            Some(ReplEvent::DeviceDisconnected {
                device_id: "emulator-5554".to_string()
            })
        );
    }

    #[test]
    fn test_channel_sink_tolerates_dropped_receiver() {
        let (sink, event_rx) = ChannelSink::new();
        drop(event_rx);
        sink.on_message("ignored".to_string());
    }
}
