//! Test doubles for the transport, device lifecycle and sink seams

use crate::adb::{AdbDevice, DeviceSource};
use crate::lifecycle::DeviceLifecycle;
use crate::sink::Sink;
use crate::transport::{Transport, TransportFactory, TransportReader};
use crate::{ReplError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// Upper bound for any wait in tests
const WAIT_LIMIT: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum Step {
    Bytes(Vec<u8>),
    End,
    Fail(ErrorKind),
}

/// Reader fed step by step from the test through a [`ReaderFeed`]
///
/// Dropping every feed reads as end-of-stream.
#[derive(Debug)]
pub struct ScriptedReader {
    step_rx: mpsc::UnboundedReceiver<Step>,
    buffered: VecDeque<u8>,
    deferred: Option<Step>,
}

/// Sending side of a [`ScriptedReader`]
#[derive(Debug, Clone)]
pub struct ReaderFeed {
    step_tx: mpsc::UnboundedSender<Step>,
}

impl ReaderFeed {
    pub fn push(&self, bytes: &[u8]) {
        let _ = self.step_tx.send(Step::Bytes(bytes.to_vec()));
    }

    pub fn end(&self) {
        let _ = self.step_tx.send(Step::End);
    }

    pub fn fail(&self, kind: ErrorKind) {
        let _ = self.step_tx.send(Step::Fail(kind));
    }
}

impl ScriptedReader {
    pub fn new() -> (Self, ReaderFeed) {
        let (step_tx, step_rx) = mpsc::unbounded_channel();
        (
            Self {
                step_rx,
                buffered: VecDeque::new(),
                deferred: None,
            },
            ReaderFeed { step_tx },
        )
    }

    fn terminal(step: Step) -> Result<Option<u8>> {
        match step {
            Step::Fail(kind) => Err(ReplError::Io(std::io::Error::from(kind))),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl TransportReader for ScriptedReader {
    async fn read_byte(&mut self) -> Result<Option<u8>> {
        if let Some(byte) = self.buffered.pop_front() {
            return Ok(Some(byte));
        }
        if let Some(step) = self.deferred.take() {
            return Self::terminal(step);
        }

        loop {
            match self.step_rx.recv().await {
                Some(Step::Bytes(bytes)) => {
                    self.buffered.extend(bytes);
                    if let Some(byte) = self.buffered.pop_front() {
                        return Ok(Some(byte));
                    }
                }
                Some(step) => return Self::terminal(step),
                None => return Ok(None),
            }
        }
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.deferred.is_none() && self.buffered.len() < buf.len() {
            match self.step_rx.try_recv() {
                Ok(Step::Bytes(bytes)) => self.buffered.extend(bytes),
                Ok(step) => self.deferred = Some(step),
                Err(_) => break,
            }
        }

        let count = self.buffered.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(self.buffered.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

#[derive(Debug, Default)]
struct Script {
    connects: Vec<Instant>,
    written: Vec<String>,
    failing_writes: u32,
    refuse: bool,
    echo: bool,
    greeting: Option<Vec<u8>>,
}

/// Transport factory whose connections follow a shared script
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    script: Arc<Mutex<Script>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes on any connection
    pub fn fail_next_writes(&self, count: u32) {
        self.script.lock().unwrap().failing_writes = count;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.script.lock().unwrap().refuse = refuse;
    }

    /// Send every written line back without its terminator
    pub fn echo_writes(&self, echo: bool) {
        self.script.lock().unwrap().echo = echo;
    }

    /// Bytes every new connection sends right away
    pub fn greet_with(&self, bytes: &[u8]) {
        self.script.lock().unwrap().greeting = Some(bytes.to_vec());
    }

    /// Times of every connection attempt
    pub fn connect_times(&self) -> Vec<Instant> {
        self.script.lock().unwrap().connects.clone()
    }

    /// Successfully written lines, without terminators
    pub fn written(&self) -> Vec<String> {
        self.script.lock().unwrap().written.clone()
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Transport>> {
        let greeting = {
            let mut script = self.script.lock().unwrap();
            script.connects.push(Instant::now());
            if script.refuse {
                return Err(ReplError::Connect("connection refused".to_string()));
            }
            script.greeting.clone()
        };

        let (reader, feed) = ScriptedReader::new();
        if let Some(bytes) = greeting {
            feed.push(&bytes);
        }

        Ok(Box::new(ScriptedTransport {
            script: self.script.clone(),
            remote_addr: format!("{}:{}", host, port),
            reader: Some(reader),
            feed: Some(feed),
        }))
    }
}

/// Connection handed out by [`ScriptedFactory`]
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    remote_addr: String,
    reader: Option<ScriptedReader>,
    /// Keeps the reader pending until the transport closes
    feed: Option<ReaderFeed>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn remote_address(&self) -> String {
        self.remote_addr.clone()
    }

    async fn write_line(&mut self, message: &str) -> Result<()> {
        let Some(feed) = self.feed.as_ref() else {
            return Err(ReplError::Io(std::io::Error::from(ErrorKind::NotConnected)));
        };

        let mut script = self.script.lock().unwrap();
        if script.failing_writes > 0 {
            script.failing_writes -= 1;
            return Err(ReplError::Io(std::io::Error::from(ErrorKind::BrokenPipe)));
        }
        script.written.push(message.to_string());
        if script.echo {
            feed.push(message.as_bytes());
        }
        Ok(())
    }

    fn take_reader(&mut self) -> Option<Box<dyn TransportReader>> {
        self.reader
            .take()
            .map(|reader| Box::new(reader) as Box<dyn TransportReader>)
    }

    async fn close(&mut self) -> Result<()> {
        self.feed = None;
        self.reader = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.feed.is_some()
    }
}

#[derive(Debug)]
struct LifecycleState {
    calls: Vec<String>,
    known: Vec<String>,
    listed: Vec<AdbDevice>,
    selected: Option<String>,
    reinstall_error: Option<String>,
    running: bool,
    forward_failures: u32,
}

/// Lifecycle manager that records every remediation call
#[derive(Debug)]
pub struct RecordingLifecycle {
    state: Mutex<LifecycleState>,
}

impl RecordingLifecycle {
    /// Lifecycle that knows `devices`, with nothing selected
    pub fn with_devices(devices: &[&str]) -> Self {
        Self {
            state: Mutex::new(LifecycleState {
                calls: Vec::new(),
                known: devices.iter().map(|d| d.to_string()).collect(),
                listed: Vec::new(),
                selected: None,
                reinstall_error: None,
                running: true,
                forward_failures: 0,
            }),
        }
    }

    /// Replace the device listing; ready devices also become selectable
    pub fn set_listed(&self, devices: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        state.listed = devices
            .iter()
            .map(|(serial, status)| AdbDevice {
                serial: serial.to_string(),
                state: status.to_string(),
            })
            .collect();
        state.known = state
            .listed
            .iter()
            .filter(|device| device.is_ready())
            .map(|device| device.serial.clone())
            .collect();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| *c == call)
            .count()
    }

    pub fn fail_reinstall(&self, reason: &str) {
        self.state.lock().unwrap().reinstall_error = Some(reason.to_string());
    }

    /// Fail the next `count` port forwards
    pub fn fail_forwards(&self, count: u32) {
        self.state.lock().unwrap().forward_failures = count;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.reinstall_error = None;
        state.forward_failures = 0;
    }

    pub fn set_running(&self, running: bool) {
        self.state.lock().unwrap().running = running;
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }
}

#[async_trait]
impl DeviceLifecycle for RecordingLifecycle {
    async fn selected_device(&self) -> Option<String> {
        self.state.lock().unwrap().selected.clone()
    }

    async fn select_device(&self, device_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.known.iter().any(|d| d == device_id) {
            return Err(ReplError::DeviceSelection {
                device_id: device_id.to_string(),
                reason: "not attached".to_string(),
            });
        }
        state.selected = Some(device_id.to_string());
        Ok(())
    }

    async fn reinstall_application(&self) -> Result<()> {
        self.record("reinstall");
        match self.state.lock().unwrap().reinstall_error.clone() {
            Some(reason) => Err(ReplError::Remediation(reason)),
            None => Ok(()),
        }
    }

    async fn kill_application(&self) -> Result<()> {
        self.record("kill");
        Ok(())
    }

    async fn start_application(&self) -> Result<()> {
        self.record("start");
        Ok(())
    }

    async fn is_application_running(&self) -> bool {
        self.record("is_running");
        self.state.lock().unwrap().running
    }

    async fn forward_port(&self, local_port: u16, remote_port: u16) -> bool {
        self.record(format!("forward {}:{}", local_port, remote_port));
        let mut state = self.state.lock().unwrap();
        if state.forward_failures > 0 {
            state.forward_failures -= 1;
            return false;
        }
        true
    }

    async fn restart_bridge(&self) {
        self.record("restart_bridge");
    }
}

#[async_trait]
impl DeviceSource for RecordingLifecycle {
    async fn list_devices(&self) -> Result<Vec<AdbDevice>> {
        Ok(self.state.lock().unwrap().listed.clone())
    }

    async fn release_device(&self, device_id: &str) {
        self.record(format!("release {}", device_id));
        let mut state = self.state.lock().unwrap();
        if state.selected.as_deref() == Some(device_id) {
            state.selected = None;
        }
    }
}

#[derive(Debug, Default)]
struct SinkLog {
    messages: Vec<String>,
    failures: Vec<String>,
    connected: Vec<String>,
    disconnected: Vec<String>,
}

/// Sink that records every callback
#[derive(Debug, Default)]
pub struct RecordingSink {
    log: Mutex<SinkLog>,
    changed: Notify,
}

impl RecordingSink {
    /// All received text, concatenated
    pub fn text(&self) -> String {
        self.log.lock().unwrap().messages.concat()
    }

    pub fn failures(&self) -> Vec<String> {
        self.log.lock().unwrap().failures.clone()
    }

    pub fn connected(&self) -> Vec<String> {
        self.log.lock().unwrap().connected.clone()
    }

    pub fn disconnected(&self) -> Vec<String> {
        self.log.lock().unwrap().disconnected.clone()
    }

    /// Wait until the received text contains `expected`
    pub async fn wait_for_text(&self, expected: &str) {
        self.wait_until(|log| log.messages.concat().contains(expected))
            .await;
    }

    /// Wait until at least one failure was reported
    pub async fn wait_for_failure(&self) {
        self.wait_until(|log| !log.failures.is_empty()).await;
    }

    async fn wait_until(&self, done: impl Fn(&SinkLog) -> bool) {
        let wait = async {
            loop {
                let changed = self.changed.notified();
                if done(&self.log.lock().unwrap()) {
                    return;
                }
                changed.await;
            }
        };
        if tokio::time::timeout(WAIT_LIMIT, wait).await.is_err() {
            panic!("sink condition not met, log: {:?}", self.log.lock().unwrap());
        }
    }

    fn update(&self, apply: impl FnOnce(&mut SinkLog)) {
        apply(&mut self.log.lock().unwrap());
        self.changed.notify_waiters();
    }
}

impl Sink for RecordingSink {
    fn on_message(&self, text: String) {
        self.update(|log| log.messages.push(text));
    }

    fn on_unrecoverable_failure(&self, error: &ReplError) {
        self.update(|log| log.failures.push(error.to_string()));
    }

    fn on_device_disconnected(&self, device_id: &str) {
        self.update(|log| log.disconnected.push(device_id.to_string()));
    }

    fn on_device_connected(&self, device_id: &str) {
        self.update(|log| log.connected.push(device_id.to_string()));
    }
}
