//! Agent settings.
//!
//! These are the agent's own knobs (paths, timings and host hooks), kept apart from the
//! device configuration blob that the provisioning portal writes. The file is TOML and
//! every field has a default, so an empty or missing file yields a working agent.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "IOTAGENT_CONFIG";
const CONFIG_DIR: &str = "iotagent";
const CONFIG_FILE: &str = "agent.toml";
const DEVICE_CONFIG_FILE: &str = "device.json";
const RESET_MARKER_FILE: &str = "factory-reset";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Location of the persisted device configuration blob
    pub device_config: PathBuf,
    /// PEM bundle used for direct-cloud TLS; the default root store is used when unset
    pub ca_file: Option<PathBuf>,
    pub wifi: WifiSettings,
    pub broker: BrokerSettings,
    pub watchdog: WatchdogSettings,
    pub device: DeviceSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_config: default_dir().join(DEVICE_CONFIG_FILE),
            ca_file: None,
            wifi: WifiSettings::default(),
            broker: BrokerSettings::default(),
            watchdog: WatchdogSettings::default(),
            device: DeviceSettings::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WifiSettings {
    /// When false the link is treated as wired and always associated
    pub enabled: bool,
    pub interface: String,
    pub poll_interval_secs: u64,
    /// Association polls before the radio is reset and asked again
    pub rebegin_after_polls: u32,
    pub link_check_secs: u64,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: "wlan0".to_string(),
            poll_interval_secs: 5,
            rebegin_after_polls: 12,
            link_check_secs: 5,
        }
    }
}

impl WifiSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn link_check(&self) -> Duration {
        Duration::from_secs(self.link_check_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    /// Suffix appended to the organization id in direct-cloud mode
    pub cloud_domain: String,
    pub retry_backoff_secs: u64,
    pub keep_alive_secs: u64,
    /// Upper bound for waiting on CONNACK, SUBACK and publish flushes
    pub ack_timeout_secs: u64,
    /// How long one main loop iteration waits for an inbound message
    pub poll_window_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            cloud_domain: "messaging.internetofthings.ibmcloud.com".to_string(),
            retry_backoff_secs: 5,
            keep_alive_secs: 15,
            ack_timeout_secs: 10,
            poll_window_ms: 100,
        }
    }
}

impl BrokerSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn poll_window(&self) -> Duration {
        Duration::from_millis(self.poll_window_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WatchdogSettings {
    pub check_period_secs: u64,
    /// Limit as a multiple of the telemetry publish interval
    pub multiplier: u32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            check_period_secs: 10,
            multiplier: 5,
        }
    }
}

impl WatchdogSettings {
    pub fn check_period(&self) -> Duration {
        Duration::from_secs(self.check_period_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    /// Command run to reboot the host, program first
    pub reboot_command: Vec<String>,
    /// Command run to fetch and apply a firmware image; `{url}` is substituted.
    /// Exit 0 means applied, exit 2 means no update available.
    pub update_command: Vec<String>,
    pub provisioning_poll_secs: u64,
    /// When this file exists at boot the device config is wiped and the file removed
    pub reset_marker: Option<PathBuf>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            reboot_command: vec!["systemctl".to_string(), "reboot".to_string()],
            update_command: vec!["iotagent-update".to_string(), "{url}".to_string()],
            provisioning_poll_secs: 5,
            reset_marker: Some(default_dir().join(RESET_MARKER_FILE)),
        }
    }
}

impl DeviceSettings {
    pub fn provisioning_poll(&self) -> Duration {
        Duration::from_secs(self.provisioning_poll_secs)
    }
}

impl AgentConfig {
    /// Path from `$IOTAGENT_CONFIG`, else `<config dir>/iotagent/agent.toml`.
    pub fn default_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => default_dir().join(CONFIG_FILE),
        }
    }

    /// Loads settings from `path`. A missing file yields defaults; a malformed file
    /// is an error.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check settings at {}: {}", path.display(), e))?
        {
            warn!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read settings {}: {}", path.display(), e))?;
        let config: AgentConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse settings {}: {}", path.display(), e))?;

        info!("Settings loaded from {}", path.display());
        Ok(config)
    }
}

fn default_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join(CONFIG_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(&dir.path().join("absent.toml"))
            .await
            .unwrap();

        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.broker.retry_backoff(), Duration::from_secs(5));
        assert_eq!(config.watchdog.check_period(), Duration::from_secs(10));
        assert_eq!(config.watchdog.multiplier, 5);
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        tokio::fs::write(
            &path,
            r#"
device_config = "/var/lib/iotagent/device.json"

[wifi]
enabled = false

[broker]
retry_backoff_secs = 1
"#,
        )
        .await
        .unwrap();

        let config = AgentConfig::load(&path).await.unwrap();

        assert_eq!(
            config.device_config,
            PathBuf::from("/var/lib/iotagent/device.json")
        );
        assert!(!config.wifi.enabled);
        assert_eq!(config.wifi.interface, "wlan0");
        assert_eq!(config.broker.retry_backoff_secs, 1);
        assert_eq!(config.broker.keep_alive_secs, 15);
        assert_eq!(config.device, DeviceSettings::default());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        tokio::fs::write(&path, "[broker\nretry_backoff_secs = ")
            .await
            .unwrap();

        assert!(AgentConfig::load(&path).await.is_err());
    }
}
