//! ADB Device Lifecycle
//!
//! [`DeviceLifecycle`] backed by the Android Debug Bridge command line tool,
//! plus a [`DeviceWatcher`] that turns device listings from any
//! [`DeviceSource`] into attach/detach notifications for the controller.

use crate::controller::ReplController;
use crate::lifecycle::DeviceLifecycle;
use crate::{ReplError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Default interval between `adb devices` polls
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// How the REPL application is found and launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbConfig {
    /// Path to the `adb` executable
    pub adb_path: PathBuf,
    /// Android package of the REPL application
    pub package: String,
    /// Activity started by `am start`, relative to the package
    pub activity: String,
    /// APK pushed by reinstall; reinstall is skipped when unset
    pub apk_path: Option<PathBuf>,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            package: "com.google.appinventor.aicompanion3".to_string(),
            activity: ".Screen1".to_string(),
            apk_path: None,
        }
    }
}

/// A line from `adb devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbDevice {
    /// Device serial
    pub serial: String,
    /// Connection state (`device`, `offline`, `unauthorized`, ...)
    pub state: String,
}

impl AdbDevice {
    /// Whether the device can accept commands
    pub fn is_ready(&self) -> bool {
        self.state == "device"
    }
}

/// Parse the output of `adb devices`
pub fn parse_devices(output: &str) -> Vec<AdbDevice> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = fields.next()?;
            Some(AdbDevice {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// Device lifecycle driven through `adb`
#[derive(Debug)]
pub struct AdbLifecycle {
    config: AdbConfig,
    selected: RwLock<Option<String>>,
}

impl AdbLifecycle {
    /// Create a lifecycle manager; `preferred` is selected without validation
    pub fn new(config: AdbConfig, preferred: Option<String>) -> Self {
        Self {
            config,
            selected: RwLock::new(preferred),
        }
    }

    /// Devices currently reported by `adb devices`
    pub async fn list_devices(&self) -> Result<Vec<AdbDevice>> {
        let stdout = self.run(&["devices"], false).await?;
        Ok(parse_devices(&stdout))
    }

    /// Arguments for an adb invocation, scoped to `serial` when given
    fn command_args<'a>(serial: Option<&'a str>, args: &[&'a str]) -> Vec<&'a str> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = serial {
            full.push("-s");
            full.push(serial);
        }
        full.extend_from_slice(args);
        full
    }

    /// Run adb and return stdout; a non-zero exit becomes an error
    async fn run(&self, args: &[&str], scoped: bool) -> Result<String> {
        let selected = if scoped {
            self.selected.read().await.clone()
        } else {
            None
        };
        let full = Self::command_args(selected.as_deref(), args);
        debug!("Running {} {}", self.config.adb_path.display(), full.join(" "));

        let output = Command::new(&self.config.adb_path)
            .args(&full)
            .output()
            .await
            .map_err(|e| ReplError::from_io_error(e, "running adb"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("adb {} failed: {}", args.join(" "), stderr.trim());
            return Err(ReplError::Remediation(format!(
                "adb {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DeviceLifecycle for AdbLifecycle {
    async fn selected_device(&self) -> Option<String> {
        self.selected.read().await.clone()
    }

    async fn select_device(&self, device_id: &str) -> Result<()> {
        let ready = ready_serials(self.list_devices().await?);
        if !ready.contains(device_id) {
            return Err(ReplError::DeviceSelection {
                device_id: device_id.to_string(),
                reason: "device is not attached or not authorized".to_string(),
            });
        }

        info!("Selected device {}", device_id);
        *self.selected.write().await = Some(device_id.to_string());
        Ok(())
    }

    async fn reinstall_application(&self) -> Result<()> {
        let Some(apk) = self.config.apk_path.as_ref() else {
            debug!("No APK configured, skipping reinstall");
            return Ok(());
        };
        let apk = apk.to_string_lossy();

        info!("Installing {}", apk);
        let stdout = self.run(&["install", "-r", &*apk], true).await?;
        // Older adb versions exit 0 on a failed install
        if let Some(line) = stdout.lines().find(|line| line.starts_with("Failure")) {
            return Err(ReplError::Remediation(line.trim().to_string()));
        }
        Ok(())
    }

    async fn kill_application(&self) -> Result<()> {
        self.run(&["shell", "am", "force-stop", self.config.package.as_str()], true)
            .await
            .map(|_| ())
    }

    async fn start_application(&self) -> Result<()> {
        let component = format!("{}/{}", self.config.package, self.config.activity);
        let stdout = self
            .run(&["shell", "am", "start", "-n", component.as_str()], true)
            .await?;
        if let Some(line) = stdout.lines().find(|line| line.starts_with("Error")) {
            return Err(ReplError::Remediation(line.trim().to_string()));
        }
        Ok(())
    }

    async fn is_application_running(&self) -> bool {
        match self
            .run(&["shell", "pidof", self.config.package.as_str()], true)
            .await
        {
            Ok(stdout) => !stdout.trim().is_empty(),
            Err(e) => {
                debug!("Running check failed: {}", e);
                false
            }
        }
    }

    async fn forward_port(&self, local_port: u16, remote_port: u16) -> bool {
        let local = format!("tcp:{}", local_port);
        let remote = format!("tcp:{}", remote_port);
        match self.run(&["forward", local.as_str(), remote.as_str()], true).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Could not forward TCP port: {}", e);
                false
            }
        }
    }

    async fn restart_bridge(&self) {
        if let Err(e) = self.run(&["kill-server"], false).await {
            warn!("adb kill-server failed: {}", e);
        }
        if let Err(e) = self.run(&["start-server"], false).await {
            warn!("adb start-server failed: {}", e);
        }
    }
}

#[async_trait]
impl DeviceSource for AdbLifecycle {
    async fn list_devices(&self) -> Result<Vec<AdbDevice>> {
        AdbLifecycle::list_devices(self).await
    }

    async fn release_device(&self, device_id: &str) {
        let mut selected = self.selected.write().await;
        if selected.as_deref() == Some(device_id) {
            info!("Released device {}", device_id);
            *selected = None;
        }
    }
}

/// Where the watcher gets its device listings from
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Every device the bridge knows about, ready or not
    async fn list_devices(&self) -> Result<Vec<AdbDevice>>;

    /// Drop the selection if it names `device_id`
    async fn release_device(&self, device_id: &str);
}

/// Serials of the devices that can accept commands
fn ready_serials(devices: Vec<AdbDevice>) -> BTreeSet<String> {
    devices
        .into_iter()
        .filter(AdbDevice::is_ready)
        .map(|device| device.serial)
        .collect()
}

/// Difference between two device snapshots
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeviceChanges {
    /// Newly attached serials
    pub attached: Vec<String>,
    /// Serials no longer present
    pub detached: Vec<String>,
}

impl DeviceChanges {
    /// Compare `previous` against `current`
    pub fn between(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> Self {
        Self {
            attached: current.difference(previous).cloned().collect(),
            detached: previous.difference(current).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty()
    }
}

/// Polls a [`DeviceSource`] and feeds attach/detach events to the controller
///
/// Only ready devices count as attached. When the selected device goes away
/// the selection is released, so the next ready device is picked up. A
/// preferred serial that has never been seen stays selected until it is.
pub struct DeviceWatcher {
    source: Arc<dyn DeviceSource>,
    controller: Arc<ReplController>,
    poll_interval: Duration,
    known: BTreeSet<String>,
}

impl DeviceWatcher {
    pub fn new(
        source: Arc<dyn DeviceSource>,
        controller: Arc<ReplController>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            controller,
            poll_interval,
            known: BTreeSet::new(),
        }
    }

    /// Poll once and deliver any changes
    pub async fn poll_once(&mut self) -> Result<DeviceChanges> {
        let current = ready_serials(self.source.list_devices().await?);
        let changes = DeviceChanges::between(&self.known, &current);

        for serial in &changes.detached {
            self.controller.on_device_detached(serial).await;
            self.source.release_device(serial).await;
        }
        for serial in &changes.attached {
            self.controller.on_device_attached(serial);
        }

        if self.controller.selected_device().await.is_none() {
            if let Some(first) = current.iter().next() {
                self.controller.select_device(first).await;
            }
        }

        self.known = current;
        Ok(changes)
    }

    /// Poll until `shutdown` flips to `true`
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        debug!("Device poll failed: {}", e);
                    }
                }
            }
        }

        debug!("Device watcher stopped");
    }
}
