//! Read Loop
//!
//! A single background task bound to one transport reader. It waits for a
//! byte, drains whatever else is already buffered, and hands the text to the
//! sink. Sending never waits on it.

use crate::sink::Sink;
use crate::transport::TransportReader;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Drain buffer size (first byte plus up to `READ_BUFFER_SIZE - 1` buffered bytes)
pub const READ_BUFFER_SIZE: usize = 1024;

/// How long [`ReadLoop::stop`] waits for the task before aborting it
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Handle to a running read loop
#[derive(Debug)]
pub struct ReadLoop {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl ReadLoop {
    /// Spawn a read loop over `reader`
    ///
    /// `pending` is a byte already consumed from the reader (the greeting
    /// probe); it is delivered before anything else.
    pub fn spawn(
        reader: Box<dyn TransportReader>,
        pending: Option<u8>,
        sink: Arc<dyn Sink>,
        stop_grace: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(reader, pending, sink, stop_rx));

        Self {
            stop_tx,
            task: Some(task),
            stop_grace,
        }
    }

    /// Check if the task is still running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the loop and wait for it to exit
    ///
    /// Idempotent. A loop that exits because of this call never reports a
    /// failure to the sink. If the task does not exit within the grace
    /// period it is aborted.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);

        let Some(mut task) = self.task.take() else {
            return;
        };

        match tokio::time::timeout(self.stop_grace, &mut task).await {
            Ok(Ok(())) => debug!("Read loop stopped"),
            Ok(Err(e)) => warn!("Read loop task ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "Read loop did not stop within {:?}, aborting",
                    self.stop_grace
                );
                task.abort();
            }
        }
    }
}

impl Drop for ReadLoop {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    mut reader: Box<dyn TransportReader>,
    mut pending: Option<u8>,
    sink: Arc<dyn Sink>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut decoder = Utf8Decoder::default();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let result = match pending.take() {
            Some(byte) => Ok(Some(byte)),
            None => {
                tokio::select! {
                    biased;
                    // Sender dropped counts as a stop request too
                    _ = stop_rx.changed() => break,
                    result = reader.read_byte() => result,
                }
            }
        };

        let first = match result {
            Ok(Some(byte)) => byte,
            Ok(None) => {
                debug!("Read loop reached end of stream");
                break;
            }
            Err(e) => {
                if !*stop_rx.borrow() {
                    error!("Read loop failed: {}", e);
                    sink.on_unrecoverable_failure(&e);
                }
                break;
            }
        };

        buffer[0] = first;
        let extra = match reader.read_available(&mut buffer[1..]) {
            Ok(n) => n,
            Err(e) => {
                if !*stop_rx.borrow() {
                    error!("Read loop failed: {}", e);
                    sink.on_unrecoverable_failure(&e);
                }
                break;
            }
        };

        let text = decoder.decode(&buffer[..extra + 1]);
        if !text.is_empty() {
            debug!("Received {} bytes", extra + 1);
            sink.on_message(text);
        }
    }

    if let Some(text) = decoder.finish() {
        sink.on_message(text);
    }
}

/// UTF-8 decoder that holds back a multi-byte sequence split across reads
#[derive(Debug, Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let mut text = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix decodes
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let carry = std::mem::take(&mut self.carry);
        Some(String::from_utf8_lossy(&carry).into_owned())
    }
}
