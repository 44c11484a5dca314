//! REPL Controller
//!
//! Keeps one logical, reliable line channel to the REPL application on the
//! selected device. A send first trusts the connection-state hint; when that
//! fails it walks an escalation ladder:
//!
//! 1. reinstall and restart the application, re-forward, reconnect, write
//! 2. restart the device bridge
//! 3. up to four reconnect-and-write attempts with doubling delays
//!
//! Only one [`ReplController::send_with_recovery`] may be in flight at a
//! time. Callers sharing a controller must serialize their sends; there is
//! no internal send queue.

use crate::config::ControllerConfig;
use crate::lifecycle::DeviceLifecycle;
use crate::read_loop::ReadLoop;
use crate::recovery::ReconnectionStrategy;
use crate::registry::DeviceRegistry;
use crate::sink::Sink;
use crate::transport::{Transport, TransportFactory, TransportReader, TcpTransportFactory};
use crate::{ReplError, Result};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Escalation rung currently being attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStep {
    /// Reinstall and restart the application, then reconnect and write
    Reinstall,
    /// Restart the device bridge before backing off
    BridgeRestart,
    /// Wait `delay`, then reconnect and write
    Backoff {
        /// 1-based attempt number
        attempt: u32,
        /// Delay before this attempt
        delay: Duration,
    },
}

/// States of a recovering send
#[derive(Debug)]
pub enum RecoveryState {
    /// Write directly on the connection believed to be healthy
    FastPath,
    /// Walking the escalation ladder
    Escalating(EscalationStep),
    /// The message was written
    Succeeded,
    /// The send gave up
    Failed(ReplError),
}

/// Transport plus the read loop draining it
#[derive(Debug, Default)]
struct Channel {
    transport: Option<Box<dyn Transport>>,
    read_loop: Option<ReadLoop>,
}

impl Channel {
    /// Stop the read loop, then close the transport
    async fn teardown(&mut self) {
        if let Some(mut read_loop) = self.read_loop.take() {
            read_loop.stop().await;
        }
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("Problem closing REPL socket: {}", e);
            }
        }
    }

    async fn write_line(&mut self, message: &str) -> Result<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.write_line(message).await,
            None => Err(ReplError::Io(std::io::Error::new(
                ErrorKind::NotConnected,
                "No open connection to the device",
            ))),
        }
    }
}

/// Controller for the channel to the device REPL
pub struct ReplController {
    config: ControllerConfig,
    lifecycle: Arc<dyn DeviceLifecycle>,
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn Sink>,
    registry: DeviceRegistry,
    /// Best-effort hint that a direct write will succeed
    happy: AtomicBool,
    channel: Mutex<Channel>,
}

impl ReplController {
    /// Create a controller that connects over TCP
    pub fn new(
        config: ControllerConfig,
        lifecycle: Arc<dyn DeviceLifecycle>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        let factory = Arc::new(TcpTransportFactory::new(config.connect_timeout));
        Self::with_transport_factory(config, factory, lifecycle, sink)
    }

    /// Create a controller with a custom transport factory
    pub fn with_transport_factory(
        config: ControllerConfig,
        factory: Arc<dyn TransportFactory>,
        lifecycle: Arc<dyn DeviceLifecycle>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            config,
            lifecycle,
            factory,
            sink,
            registry: DeviceRegistry::new(),
            happy: AtomicBool::new(false),
            channel: Mutex::new(Channel::default()),
        }
    }

    /// Whether the controller believes a direct write will succeed
    pub fn is_happy(&self) -> bool {
        self.happy.load(Ordering::SeqCst)
    }

    /// Number of attached devices
    pub fn attached_devices(&self) -> usize {
        self.registry.attached()
    }

    /// Whether a transport is currently open
    pub async fn is_connected(&self) -> bool {
        let channel = self.channel.lock().await;
        channel
            .transport
            .as_ref()
            .is_some_and(|transport| transport.is_open())
    }

    /// Whether a read loop is currently running
    pub async fn is_reading(&self) -> bool {
        let channel = self.channel.lock().await;
        channel
            .read_loop
            .as_ref()
            .is_some_and(|read_loop| read_loop.is_running())
    }

    /// Send on a connection already known to be healthy
    ///
    /// Never escalates. Fails immediately with
    /// [`ReplError::ChannelUnhappy`] when the channel is not happy; a failed
    /// write marks it unhappy.
    pub async fn send_fast(&self, message: &str) -> Result<()> {
        debug!("Sending '{}' on fast path", message);

        if !self.is_happy() {
            return Err(ReplError::ChannelUnhappy);
        }

        let mut channel = self.channel.lock().await;
        if let Err(e) = channel.write_line(message).await {
            self.happy.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Send `message`, escalating through recovery steps as needed
    ///
    /// With `force_restart` the fast path is skipped and the application is
    /// always reinstalled and restarted first. The controller stays usable
    /// after any failure.
    pub async fn send_with_recovery(&self, message: &str, force_restart: bool) -> Result<()> {
        let mut channel = self.channel.lock().await;

        debug!(
            "Sending '{}': attached={} happy={} force_restart={}",
            message,
            self.registry.attached(),
            self.is_happy(),
            force_restart
        );

        let mut strategy: ReconnectionStrategy = self.config.backoff.clone();
        strategy.reset();
        let mut last_error: Option<ReplError> = None;

        let mut state = if self.is_happy() && !force_restart {
            RecoveryState::FastPath
        } else {
            self.happy.store(false, Ordering::SeqCst);
            self.check_preconditions().await
        };

        loop {
            state = match state {
                RecoveryState::FastPath => match channel.write_line(message).await {
                    Ok(()) => RecoveryState::Succeeded,
                    Err(e) => {
                        debug!("Write failed ({}), trying to reconnect", e);
                        self.happy.store(false, Ordering::SeqCst);
                        self.check_preconditions().await
                    }
                },

                RecoveryState::Escalating(EscalationStep::Reinstall) => {
                    info!(
                        "Reinstalling and restarting the device application (recovery waits up to {:?})",
                        self.config.worst_case_ladder()
                    );
                    match self.remediate().await {
                        // Backoff only makes sense once the app is freshly started
                        Err(e) => RecoveryState::Failed(e),
                        Ok(()) => match self.reconnect_and_write(&mut channel, message).await {
                            Ok(()) => RecoveryState::Succeeded,
                            Err(e) => {
                                warn!("Reinstall was not enough: {}", e);
                                last_error = Some(e);
                                RecoveryState::Escalating(EscalationStep::BridgeRestart)
                            }
                        },
                    }
                }

                RecoveryState::Escalating(EscalationStep::BridgeRestart) => {
                    info!(
                        "Restarting device bridge, then reconnecting for up to {:?}",
                        strategy.total_remaining()
                    );
                    self.lifecycle.restart_bridge().await;
                    Self::next_backoff(&mut strategy, &mut last_error)
                }

                RecoveryState::Escalating(EscalationStep::Backoff { attempt, delay }) => {
                    debug!("Waiting {:?} before reconnecting: {}", delay, strategy.status());
                    sleep(delay).await;
                    match self.reconnect_and_write(&mut channel, message).await {
                        Ok(()) => RecoveryState::Succeeded,
                        Err(e) => {
                            warn!("Connection attempt {} failed: {}", attempt, e);
                            last_error = Some(e);
                            Self::next_backoff(&mut strategy, &mut last_error)
                        }
                    }
                }

                RecoveryState::Succeeded => {
                    self.happy.store(true, Ordering::SeqCst);
                    debug!("Sent '{}'", message);
                    return Ok(());
                }

                RecoveryState::Failed(e) => {
                    self.happy.store(false, Ordering::SeqCst);
                    warn!("Giving up on sending to device: {}", e);
                    return Err(e);
                }
            };
        }
    }

    fn next_backoff(
        strategy: &mut ReconnectionStrategy,
        last_error: &mut Option<ReplError>,
    ) -> RecoveryState {
        match strategy.next_delay() {
            Some(delay) => RecoveryState::Escalating(EscalationStep::Backoff {
                attempt: strategy.attempt,
                delay,
            }),
            None => {
                let reason = last_error
                    .take()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "Failed to restart communication".to_string());
                RecoveryState::Failed(ReplError::LadderExhausted(reason))
            }
        }
    }

    /// Fatal preconditions checked before any remediation
    async fn check_preconditions(&self) -> RecoveryState {
        let Some(device) = self.lifecycle.selected_device().await else {
            return RecoveryState::Failed(ReplError::NoDeviceSelected);
        };
        if self.registry.attached() == 0 {
            return RecoveryState::Failed(ReplError::NoDevicesAttached);
        }
        debug!("Escalating recovery for device {}", device);
        RecoveryState::Escalating(EscalationStep::Reinstall)
    }

    async fn remediate(&self) -> Result<()> {
        self.lifecycle
            .reinstall_application()
            .await
            .map_err(into_remediation)?;
        self.restart_application().await
    }

    /// Kill and start the application, then poll until it reports running
    ///
    /// Times out optimistically: the write that follows is the real check.
    async fn restart_application(&self) -> Result<()> {
        self.lifecycle
            .kill_application()
            .await
            .map_err(into_remediation)?;
        self.lifecycle
            .start_application()
            .await
            .map_err(into_remediation)?;

        let policy = self.config.restart;
        for poll in 1..=policy.max_polls {
            sleep(policy.poll_interval).await;
            if self.lifecycle.is_application_running().await {
                debug!("Application running after {} polls", poll);
                return Ok(());
            }
        }

        debug!(
            "Application not confirmed running after {:?}, continuing",
            policy.max_wait()
        );
        Ok(())
    }

    async fn reconnect_and_write(&self, channel: &mut Channel, message: &str) -> Result<()> {
        self.establish_channel(channel).await?;
        channel.write_line(message).await
    }

    /// Tear down and rebuild the forward, transport and read loop
    async fn establish_channel(&self, channel: &mut Channel) -> Result<()> {
        // A stale forward may point at a dead socket, so re-forward every time
        channel.teardown().await;

        let (local, remote) = (self.config.local_port, self.config.remote_port);
        if !self.lifecycle.forward_port(local, remote).await {
            return Err(ReplError::PortForward { local, remote });
        }

        debug!(
            "Establishing communication with {}:{}",
            self.config.host, local
        );
        let mut transport = self.factory.connect(&self.config.host, local).await?;
        let Some(mut reader) = transport.take_reader() else {
            let _ = transport.close().await;
            return Err(ReplError::Connect("transport has no reader".to_string()));
        };

        let pending = if self.config.probe_greeting {
            match self.await_greeting(reader.as_mut()).await {
                Ok(byte) => Some(byte),
                Err(e) => {
                    let _ = transport.close().await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let read_loop = ReadLoop::spawn(reader, pending, self.sink.clone(), self.config.stop_grace);
        info!("Connected to device REPL at {}", transport.remote_address());
        channel.transport = Some(transport);
        channel.read_loop = Some(read_loop);
        Ok(())
    }

    async fn await_greeting(&self, reader: &mut dyn TransportReader) -> Result<u8> {
        match timeout(self.config.greeting_timeout, reader.read_byte()).await {
            Ok(Ok(Some(byte))) => Ok(byte),
            Ok(Ok(None)) => Err(ReplError::Connect(
                "Input stream closed before anything arrived on it".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ReplError::Connect(format!(
                "nothing received within {:?}",
                self.config.greeting_timeout
            ))),
        }
    }

    /// Tear down the transport and read loop
    ///
    /// Idempotent. Leaves the channel unhappy.
    pub async fn reset(&self) {
        let mut channel = self.channel.lock().await;
        self.happy.store(false, Ordering::SeqCst);
        channel.teardown().await;
        debug!("Channel reset");
    }

    /// Notification that a device was attached
    pub fn on_device_attached(&self, device_id: &str) {
        let attached = self.registry.device_attached(device_id);
        info!("Device connected: {} devices attached", attached);
        self.sink.on_device_connected(device_id);
    }

    /// Notification that a device was detached
    ///
    /// Detaching the selected device marks the channel unhappy even if no
    /// write has failed yet.
    pub async fn on_device_detached(&self, device_id: &str) {
        let detach = self.registry.device_detached(device_id);

        if self.lifecycle.selected_device().await.as_deref() == Some(device_id) {
            self.happy.store(false, Ordering::SeqCst);
            info!("Selected device {} disconnected", device_id);
        } else {
            info!(
                "Device {} disconnected: {} devices attached",
                device_id, detach.attached
            );
        }

        self.sink.on_device_disconnected(device_id);
    }

    /// Device currently targeted for communication
    pub async fn selected_device(&self) -> Option<String> {
        self.lifecycle.selected_device().await
    }

    /// Target `device_id`; returns `false` if the lifecycle manager refuses
    pub async fn select_device(&self, device_id: &str) -> bool {
        match self.lifecycle.select_device(device_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to select device {}: {}", device_id, e);
                false
            }
        }
    }
}

fn into_remediation(error: ReplError) -> ReplError {
    match error {
        ReplError::Remediation(_) => error,
        other => ReplError::Remediation(other.to_string()),
    }
}
