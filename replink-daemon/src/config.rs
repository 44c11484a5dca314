//! Daemon Configuration
//!
//! Configuration management for the replink daemon.

use anyhow::{bail, Context, Result};
use replink_protocol::{
    AdbConfig, ControllerConfig, ReconnectionStrategy, RestartPolicy, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_GREETING_TIMEOUT, DEFAULT_REPL_PORT, DEFAULT_WATCH_INTERVAL,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device and application configuration
    #[serde(default)]
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Recovery ladder configuration
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Device watcher configuration
    #[serde(default)]
    pub watch: WatchConfig,
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Path to the adb executable
    #[serde(default = "default_adb_path")]
    pub adb_path: PathBuf,

    /// Package of the REPL application
    #[serde(default = "default_package")]
    pub package: String,

    /// Activity launched on restart
    #[serde(default = "default_activity")]
    pub activity: String,

    /// APK installed on reinstall (reinstall is skipped if unset)
    #[serde(default)]
    pub apk_path: Option<PathBuf>,

    /// Serial to select at startup
    #[serde(default)]
    pub preferred_serial: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host the forwarded port is reachable on
    #[serde(default = "default_host")]
    pub host: String,

    /// Local end of the port forward
    #[serde(default = "default_port")]
    pub local_port: u16,

    /// REPL port on the device
    #[serde(default = "default_port")]
    pub remote_port: u16,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Wait for the REPL to send something before using a new connection
    #[serde(default = "default_probe_greeting")]
    pub probe_greeting: bool,

    /// Greeting timeout in seconds
    #[serde(default = "default_greeting_timeout")]
    pub greeting_timeout_secs: u64,
}

/// Recovery ladder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Delay before the first backoff attempt in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Number of backoff attempts after a bridge restart
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound for a single backoff delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Interval between "is the app running" checks in milliseconds
    #[serde(default = "default_restart_poll")]
    pub restart_poll_ms: u64,

    /// Number of running checks after a restart
    #[serde(default = "default_restart_polls")]
    pub restart_polls: u32,
}

/// Device watcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Interval between `adb devices` polls in milliseconds
    #[serde(default = "default_watch_interval")]
    pub poll_interval_ms: u64,
}

fn default_adb_path() -> PathBuf {
    PathBuf::from("adb")
}

fn default_package() -> String {
    AdbConfig::default().package
}

fn default_activity() -> String {
    AdbConfig::default().activity
}

fn default_host() -> String {
    ControllerConfig::default().host
}

fn default_port() -> u16 {
    DEFAULT_REPL_PORT
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_greeting_timeout() -> u64 {
    DEFAULT_GREETING_TIMEOUT.as_secs()
}

fn default_probe_greeting() -> bool {
    ControllerConfig::default().probe_greeting
}

fn default_initial_delay() -> u64 {
    ReconnectionStrategy::default().initial_delay.as_millis() as u64
}

fn default_max_attempts() -> u32 {
    ReconnectionStrategy::default().max_attempts
}

fn default_max_delay() -> u64 {
    ReconnectionStrategy::default().max_delay.as_millis() as u64
}

fn default_restart_poll() -> u64 {
    RestartPolicy::default().poll_interval.as_millis() as u64
}

fn default_restart_polls() -> u32 {
    RestartPolicy::default().max_polls
}

fn default_watch_interval() -> u64 {
    DEFAULT_WATCH_INTERVAL.as_millis() as u64
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            package: default_package(),
            activity: default_activity(),
            apk_path: None,
            preferred_serial: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            local_port: default_port(),
            remote_port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            probe_greeting: default_probe_greeting(),
            greeting_timeout_secs: default_greeting_timeout(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_attempts: default_max_attempts(),
            max_delay_ms: default_max_delay(),
            restart_poll_ms: default_restart_poll(),
            restart_polls: default_restart_polls(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_watch_interval(),
        }
    }
}

impl WatchConfig {
    /// Poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("replink")
            .join("daemon.toml")
    }

    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, creating a default file if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            let config = Config::default();
            config.save_to(path)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Reject values the controller cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.watch.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be non-zero");
        }
        self.controller_config()
            .validate()
            .context("Invalid [network] or [recovery] settings")?;
        Ok(())
    }

    /// Controller settings derived from this configuration
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            host: self.network.host.clone(),
            local_port: self.network.local_port,
            remote_port: self.network.remote_port,
            connect_timeout: Duration::from_secs(self.network.connect_timeout_secs),
            probe_greeting: self.network.probe_greeting,
            greeting_timeout: Duration::from_secs(self.network.greeting_timeout_secs),
            backoff: ReconnectionStrategy::with_limits(
                Duration::from_millis(self.recovery.initial_delay_ms),
                self.recovery.max_attempts,
                Duration::from_millis(self.recovery.max_delay_ms),
            ),
            restart: RestartPolicy {
                poll_interval: Duration::from_millis(self.recovery.restart_poll_ms),
                max_polls: self.recovery.restart_polls,
            },
            ..ControllerConfig::default()
        }
    }

    /// adb settings derived from this configuration
    pub fn adb_config(&self) -> AdbConfig {
        AdbConfig {
            adb_path: self.device.adb_path.clone(),
            package: self.device.package.clone(),
            activity: self.device.activity.clone(),
            apk_path: self.device.apk_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_matches_controller_defaults() {
        let config = Config::default();
        let controller = config.controller_config();
        let defaults = ControllerConfig::default();

        assert_eq!(controller.host, defaults.host);
        assert_eq!(controller.local_port, defaults.local_port);
        assert_eq!(controller.remote_port, defaults.remote_port);
        assert_eq!(controller.connect_timeout, defaults.connect_timeout);
        assert_eq!(controller.probe_greeting, defaults.probe_greeting);
        assert_eq!(controller.greeting_timeout, defaults.greeting_timeout);
        assert_eq!(controller.backoff, defaults.backoff);
        assert_eq!(controller.restart, defaults.restart);
        assert_eq!(config.watch.poll_interval(), DEFAULT_WATCH_INTERVAL);
        assert_eq!(config.adb_config(), AdbConfig::default());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("daemon.toml");

        let config = Config::load_from(&path).unwrap();

        assert!(path.exists());
        assert_eq!(config, Config::default());
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(
            &path,
            "[device]\napk_path = \"/tmp/companion.apk\"\n\n[network]\nlocal_port = 8001\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();

        assert_eq!(config.network.local_port, 8001);
        assert_eq!(config.network.remote_port, DEFAULT_REPL_PORT);
        assert_eq!(
            config.device.apk_path,
            Some(PathBuf::from("/tmp/companion.apk"))
        );
        assert_eq!(config.recovery, RecoveryConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(&path, "[recovery]\ninitial_delay_ms = 5000\nmax_delay_ms = 10\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("[recovery]"));
        assert!(format!("{:#}", err).contains("max delay"));

        fs::write(&path, "[watch]\npoll_interval_ms = 0\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(&path, "[network\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_round_trip_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.toml");
        let mut config = Config::default();
        config.device.preferred_serial = Some("emulator-5556".to_string());
        config.recovery.max_attempts = 2;

        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }
}
