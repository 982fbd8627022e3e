//! # Persistence Module
//!
//! ## Why This Module Exists
//! The device configuration is the single piece of state that survives a reboot. It holds
//! the Wi-Fi credentials, the platform identity (organization, device type, device id,
//! token) and a free-form `meta` map of device tunables such as the telemetry publish
//! interval. Everything else the agent knows is derived from it at startup.
//!
//! ## Key Abstractions
//! - **[`DeviceConfig`]**: flat string-keyed fields plus the nested `meta` map, serialized
//!   as one JSON blob so the provisioning portal and the agent share a format
//! - **[`MaskedConfig`]**: redacted view used for diagnostics and the `config` command;
//!   never used to build credentials for the wire
//! - **[`config_store::ConfigStore`]**: loads and saves the blob
//!
//! ## Error Handling Strategy
//! Loading never fails: a missing or corrupt blob degrades to the empty default, which
//! classifies the device as unprovisioned. Saving reports a [`config_store::StoreError`]
//! that callers log and move past.

pub mod config_store;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Placeholder written over secret values in masked views.
pub const MASK: &str = "********";

/// Value of the `config` field once the portal has completed provisioning.
pub const PROVISIONED_SENTINEL: &str = "done";

/// Fields that must be present and non-empty on a provisioned device.
pub const REQUIRED_KEYS: [&str; 6] = ["ssid", "w_pw", "org", "devType", "devId", "token"];

const SECRET_KEYS: [&str; 2] = ["w_pw", "token"];

/// Meta key carrying the telemetry publish interval in milliseconds.
pub const PUBLISH_INTERVAL_KEY: &str = "pubInterval";

/// Persisted device configuration.
///
/// ## Design Rationale
/// Kept as JSON maps instead of a fixed struct because the portal may write arbitrary
/// extra fields (user-defined form inputs) and the platform may push arbitrary `meta`
/// keys. Typed accessors cover the fields the agent itself depends on.
#[derive(Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct DeviceConfig {
    /// Device tunables, replaced wholesale by the remote metadata update
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Every other top-level field
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DeviceConfig {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a top-level string field, treating empty strings as absent.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Returns a scalar field as text. Numbers and bools are rendered, empty strings
    /// and nested values count as absent.
    pub fn get_text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(text) if !text.is_empty() => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// A device is provisioned once the portal marked it done and every required
    /// credential is filled in.
    pub fn is_provisioned(&self) -> bool {
        self.get_str("config") == Some(PROVISIONED_SENTINEL)
            && REQUIRED_KEYS.iter().all(|key| self.get_text(key).is_some())
    }

    /// Platform identity, available only when all identity fields are set.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        Some(DeviceIdentity {
            org: self.get_text("org")?,
            dev_type: self.get_text("devType")?,
            dev_id: self.get_text("devId")?,
            token: self.get_text("token")?,
        })
    }

    /// Telemetry publish interval from `meta.pubInterval`.
    ///
    /// Accepts a numeric string or a JSON number of milliseconds. Anything else yields
    /// zero, which disables periodic publishing.
    pub fn publish_interval(&self) -> Duration {
        let millis = match self.meta.get(PUBLISH_INTERVAL_KEY) {
            Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
            Some(Value::Number(number)) => number.as_u64(),
            _ => None,
        };
        millis.map(Duration::from_millis).unwrap_or(Duration::ZERO)
    }

    /// Redacted copy with `w_pw` and `token` replaced by [`MASK`].
    pub fn masked(&self) -> MaskedConfig {
        let mut view = self.fields.clone();
        for key in SECRET_KEYS {
            view.insert(key.to_string(), Value::String(MASK.to_string()));
        }
        view.insert("meta".to_string(), Value::Object(self.meta.clone()));
        MaskedConfig(Value::Object(view))
    }
}

// Debug output goes through the masked view so secrets never reach the logs.
impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceConfig({})", self.masked())
    }
}

/// Identity used to derive topics, client ids and broker credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub org: String,
    pub dev_type: String,
    pub dev_id: String,
    pub token: String,
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("org", &self.org)
            .field("dev_type", &self.dev_type)
            .field("dev_id", &self.dev_id)
            .field("token", &MASK)
            .finish()
    }
}

/// Secret-free JSON view of a [`DeviceConfig`].
#[derive(Clone, PartialEq)]
pub struct MaskedConfig(Value);

impl MaskedConfig {
    /// Adds a field to the view only; the underlying config is untouched.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.0 {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl fmt::Display for MaskedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_string(&self.0).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

impl fmt::Debug for MaskedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
pub(crate) fn provisioned_config(org: &str) -> DeviceConfig {
    let mut config = DeviceConfig::default();
    config.set("ssid", "plant-floor");
    config.set("w_pw", "wifi-secret-123");
    config.set("org", org);
    config.set("devType", "purifier");
    config.set("devId", "unit-7");
    config.set("token", "tok-very-secret");
    config.set("config", PROVISIONED_SENTINEL);
    config
        .meta
        .insert(PUBLISH_INTERVAL_KEY.to_string(), Value::from("5000"));
    config
}
