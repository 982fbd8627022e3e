//! Network reachability: the Wi-Fi link and host name resolution.
//!
//! The agent never touches a socket until [`supervisor::NetworkSupervisor`] reports the
//! link as up. Both the radio and the resolver are capabilities so the supervisor and
//! the session layer can be exercised without real hardware.

pub mod radio;
pub mod supervisor;

use crate::persistence::{DeviceConfig, MASK};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NetworkError {
    #[error("Radio command failed: {0}")]
    Radio(String),

    #[error("Unable to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn from_config(config: &DeviceConfig) -> Option<Self> {
        Some(Self {
            ssid: config.get_text("ssid")?,
            password: config.get_text("w_pw")?,
        })
    }
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &MASK)
            .finish()
    }
}

/// Station-mode radio.
pub trait WifiRadio {
    /// Starts associating with the given network. Returns once the request is issued.
    async fn begin(&mut self, credentials: &WifiCredentials) -> Result<(), NetworkError>;

    async fn disconnect(&mut self) -> Result<(), NetworkError>;

    async fn is_associated(&mut self) -> bool;
}

pub trait Resolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, NetworkError>;
}

/// Resolver backed by the host's name service. `.local` names resolve when the host
/// runs an mDNS responder plugged into the system resolver.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, NetworkError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let failed = |reason: String| NetworkError::Resolve {
            host: host.to_string(),
            reason,
        };

        let mut addrs = timeout(self.timeout, tokio::net::lookup_host((host, 0)))
            .await
            .map_err(|_| failed("timed out".to_string()))?
            .map_err(|e| failed(e.to_string()))?;

        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| failed("no addresses".to_string()))
    }
}
