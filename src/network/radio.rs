//! Host radios driven through NetworkManager's `nmcli`.

use super::{NetworkError, WifiCredentials, WifiRadio};
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum HostRadio {
    Nmcli { interface: String },
    /// Ethernet or any link managed outside the agent; always associated
    Wired,
}

impl HostRadio {
    async fn nmcli(args: &[&str]) -> Result<String, NetworkError> {
        let output = Command::new("nmcli")
            .args(args)
            .output()
            .await
            .map_err(|e| NetworkError::Radio(format!("nmcli unavailable: {e}")))?;

        if !output.status.success() {
            return Err(NetworkError::Radio(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl WifiRadio for HostRadio {
    async fn begin(&mut self, credentials: &WifiCredentials) -> Result<(), NetworkError> {
        match self {
            HostRadio::Nmcli { interface } => {
                debug!("Requesting association with {}", credentials.ssid);
                Self::nmcli(&[
                    "device",
                    "wifi",
                    "connect",
                    credentials.ssid.as_str(),
                    "password",
                    credentials.password.as_str(),
                    "ifname",
                    interface.as_str(),
                ])
                .await
                .map(|_| ())
            }
            HostRadio::Wired => Ok(()),
        }
    }

    async fn disconnect(&mut self) -> Result<(), NetworkError> {
        match self {
            HostRadio::Nmcli { interface } => {
                Self::nmcli(&["device", "disconnect", interface.as_str()])
                    .await
                    .map(|_| ())
            }
            HostRadio::Wired => Ok(()),
        }
    }

    async fn is_associated(&mut self) -> bool {
        match self {
            HostRadio::Nmcli { interface } => {
                match Self::nmcli(&["-t", "-f", "DEVICE,STATE", "device"]).await {
                    Ok(listing) => device_connected(&listing, interface),
                    Err(e) => {
                        warn!("Unable to query {}: {}", interface, e);
                        false
                    }
                }
            }
            HostRadio::Wired => true,
        }
    }
}

/// Reads `nmcli -t -f DEVICE,STATE device` output.
fn device_connected(listing: &str, interface: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_once(':'))
        .any(|(device, state)| device == interface && state.trim() == "connected")
}
