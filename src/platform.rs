//! Host capabilities: power control, firmware updates and the default device app.

use crate::command::{DeviceApp, Uplink};
use crate::mqtt::message_manager::InboundCommand;
use chrono::Local;
use serde_json::{Map, Value};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of asking the updater to fetch and apply an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Failed,
    NoUpdateAvailable,
    /// The image is installed; normally the host restarts before this is seen
    Applied,
}

/// Hard reboot. Called from the main loop and from the watchdog task.
pub trait PowerControl: Send + Sync {
    fn hard_reboot(&self);
}

pub trait FirmwareUpdater {
    async fn apply(&mut self, url: &str) -> UpdateOutcome;
}

/// Reboots by running the configured host command, then exits the process so a stuck
/// command cannot keep the agent alive.
#[derive(Debug, Clone)]
pub struct SystemPower {
    command: Vec<String>,
}

impl SystemPower {
    pub fn new(command: Vec<String>) -> Arc<Self> {
        Arc::new(Self { command })
    }
}

impl PowerControl for SystemPower {
    fn hard_reboot(&self) {
        error!("Rebooting device");
        match self.command.split_first() {
            Some((program, args)) => {
                if let Err(e) = std::process::Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .spawn()
                {
                    error!("Unable to run reboot command {}: {}", program, e);
                }
            }
            None => warn!("No reboot command configured"),
        }
        std::process::exit(1);
    }
}

/// Runs an external update tool. `{url}` in the arguments is replaced by the image URL.
/// Exit status 0 means applied, 2 means nothing to update, anything else failed.
#[derive(Debug, Clone)]
pub struct CommandUpdater {
    command: Vec<String>,
}

const EXIT_NO_UPDATE: i32 = 2;

impl CommandUpdater {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl FirmwareUpdater for CommandUpdater {
    async fn apply(&mut self, url: &str) -> UpdateOutcome {
        let Some((program, args)) = self.command.split_first() else {
            warn!("No update command configured");
            return UpdateOutcome::Failed;
        };
        let args: Vec<String> = args.iter().map(|arg| arg.replace("{url}", url)).collect();

        info!("Applying firmware from {}", url);
        match Command::new(program).args(&args).status().await {
            Ok(status) if status.success() => UpdateOutcome::Applied,
            Ok(status) if status.code() == Some(EXIT_NO_UPDATE) => UpdateOutcome::NoUpdateAvailable,
            Ok(status) => {
                warn!("Update command exited with {}", status);
                UpdateOutcome::Failed
            }
            Err(e) => {
                warn!("Unable to run update command {}: {}", program, e);
                UpdateOutcome::Failed
            }
        }
    }
}

/// Default application: publishes basic host status and ignores custom commands.
#[derive(Debug)]
pub struct HostStatus {
    started: Instant,
}

impl HostStatus {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for HostStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceApp for HostStatus {
    fn collect_status(&mut self) -> Map<String, Value> {
        let mut d = Map::new();
        d.insert(
            "uptime".to_string(),
            Value::from(self.started.elapsed().as_secs()),
        );
        d.insert(
            "timestamp".to_string(),
            Value::from(Local::now().to_rfc3339()),
        );
        d.insert(
            "version".to_string(),
            Value::from(env!("CARGO_PKG_VERSION")),
        );
        d
    }

    async fn handle_command<U: Uplink>(&mut self, command: &InboundCommand, _uplink: &mut U) {
        debug!("No handler for {}", command);
    }

    fn metadata_updated(&mut self, meta: &Map<String, Value>) {
        info!("Device metadata updated: {}", serde_json::Value::Object(meta.clone()));
    }
}
