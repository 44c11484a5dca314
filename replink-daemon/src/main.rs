mod config;
mod diagnostics;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use diagnostics::{Cli, Command};
use replink_protocol::{AdbLifecycle, ChannelSink, DeviceWatcher, ReplController, ReplEvent};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A running controller with its device watcher and event printer
struct Session {
    controller: Arc<ReplController>,
    shutdown_tx: watch::Sender<bool>,
    watcher: JoinHandle<()>,
    printer: JoinHandle<()>,
}

impl Session {
    async fn start(config: &Config) -> Result<Self> {
        let lifecycle = Arc::new(AdbLifecycle::new(
            config.adb_config(),
            config.device.preferred_serial.clone(),
        ));
        let (sink, event_rx) = ChannelSink::new();
        let controller = Arc::new(ReplController::new(
            config.controller_config(),
            lifecycle.clone(),
            Arc::new(sink),
        ));

        let mut watcher = DeviceWatcher::new(
            lifecycle.clone(),
            controller.clone(),
            config.watch.poll_interval(),
        );
        // Seed the attached count before the first send
        match watcher.poll_once().await {
            Ok(changes) => debug!("Initial devices: {:?}", changes.attached),
            Err(e) => warn!("Could not list devices: {}", e),
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = tokio::spawn(watcher.run(shutdown_rx));
        let printer = tokio::spawn(print_events(event_rx));

        match controller.selected_device().await {
            Some(device) => info!("Using device {}", device),
            None => warn!("No device selected yet"),
        }

        Ok(Self {
            controller,
            shutdown_tx,
            watcher,
            printer,
        })
    }

    async fn send(&self, message: &str, force_restart: bool) -> bool {
        match self
            .controller
            .send_with_recovery(message, force_restart)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                eprintln!("{}", e.user_message());
                if e.requires_user_action() {
                    warn!("Send failed until the device setup changes: {}", e);
                } else if e.is_recoverable() {
                    info!("Send failed, the next one reconnects: {}", e);
                } else {
                    error!("Send failed: {}", e);
                }
                false
            }
        }
    }

    async fn shutdown(self) {
        self.controller.reset().await;
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.watcher.await {
            debug!("Device watcher ended abnormally: {}", e);
        }
        self.printer.abort();
        info!("Session closed");
    }
}

async fn print_events(mut event_rx: mpsc::UnboundedReceiver<ReplEvent>) {
    while let Some(event) = event_rx.recv().await {
        match event {
            ReplEvent::Message(text) => {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            ReplEvent::Failure { message } => eprintln!("Connection lost: {}", message),
            ReplEvent::DeviceConnected { device_id } => eprintln!("Device connected: {}", device_id),
            ReplEvent::DeviceDisconnected { device_id } => {
                eprintln!("Device disconnected: {}", device_id)
            }
        }
    }
}

/// Send every stdin line until EOF
async fn interactive(session: &Session, force_restart: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut force_restart = force_restart;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        session.send(&line, force_restart).await;
        force_restart = false;
    }

    Ok(())
}

async fn list_devices(config: &Config) -> Result<()> {
    let lifecycle = AdbLifecycle::new(config.adb_config(), None);
    let devices = lifecycle
        .list_devices()
        .await
        .context("Failed to list devices")?;

    if devices.is_empty() {
        println!("No devices attached");
    }
    for device in devices {
        println!("{}\t{}", device.serial, device.state);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    match &cli.command {
        Some(Command::DumpConfig) => {
            let contents = toml::to_string_pretty(&config).context("Failed to serialize config")?;
            print!("{}", contents);
            return Ok(());
        }
        Some(Command::Devices) => return list_devices(&config).await,
        _ => {}
    }

    info!(
        "Starting replink: {}:{} -> device port {}",
        config.network.host, config.network.local_port, config.network.remote_port
    );
    let session = Session::start(&config)
        .await
        .context("Failed to start session")?;

    match &cli.command {
        Some(Command::Send { message, settle }) => {
            let sent = session.send(message, cli.force_restart).await;
            if sent {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(*settle)) => {}
                    _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
                }
            }
            session.shutdown().await;
            if sent {
                Ok(())
            } else {
                Err(anyhow::anyhow!("Failed to send message"))
            }
        }
        _ => {
            info!("Reading messages from stdin, press Ctrl+C to stop");
            let result = tokio::select! {
                result = interactive(&session, cli.force_restart) => result,
                signal = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    signal.context("Failed to listen for Ctrl+C")
                }
            };
            session.shutdown().await;
            result
        }
    }
}
