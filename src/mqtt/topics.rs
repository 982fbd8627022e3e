//! Topic namespace for the device.
//!
//! A device either talks to the cloud platform directly or through a local gateway
//! broker. Both use the same eight topics; the gateway form additionally names the
//! device inside every topic, right after the first path segment:
//!
//! ```text
//! direct:  iotdm-1/device/update
//! gateway: iotdm-1/type/<devType>/id/<devId>/device/update
//! ```

use std::fmt;

const PUBLISH_TEMPLATE: &str = "iot-2/evt/status/fmt/json";
const INFO_TEMPLATE: &str = "iot-2/evt/info/fmt/json";
const COMMAND_TEMPLATE: &str = "iot-2/cmd/+/fmt/+";
const RESPONSE_TEMPLATE: &str = "iotdm-1/response";
const MANAGE_TEMPLATE: &str = "iotdevice-1/mgmt/manage";
const UPDATE_TEMPLATE: &str = "iotdm-1/device/update";
const REBOOT_TEMPLATE: &str = "iotdm-1/mgmt/initiate/device/reboot";
const RESET_TEMPLATE: &str = "iotdm-1/mgmt/initiate/device/factory_reset";

pub const CLOUD_PORT: u16 = 8883;
pub const GATEWAY_PORT: u16 = 1883;

/// How the device reaches its broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// `org` is an organization id; TLS to the platform's hostname.
    DirectCloud,
    /// `org` is the address of a local gateway broker; plain TCP.
    Gateway,
}

impl ConnectionMode {
    /// An `org` containing a dot is treated as a gateway address.
    pub fn for_org(org: &str) -> Self {
        if org.contains('.') {
            Self::Gateway
        } else {
            Self::DirectCloud
        }
    }

    pub fn port(self) -> u16 {
        match self {
            Self::DirectCloud => CLOUD_PORT,
            Self::Gateway => GATEWAY_PORT,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::DirectCloud)
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectCloud => write!(f, "direct-cloud"),
            Self::Gateway => write!(f, "gateway"),
        }
    }
}

/// The eight topics of one device, all in the same form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub mode: ConnectionMode,
    pub publish: String,
    pub info: String,
    pub command: String,
    pub response: String,
    pub manage: String,
    pub update: String,
    pub reboot: String,
    pub reset: String,
}

impl TopicSet {
    /// Topics the session subscribes to, in subscription order.
    pub fn command_subscriptions(&self) -> [&str; 5] {
        [
            &self.response,
            &self.reboot,
            &self.reset,
            &self.update,
            &self.command,
        ]
    }
}

/// Builds the topic set for a device. Call once per process; the result is immutable.
pub fn derive_topics(org: &str, dev_type: &str, dev_id: &str) -> TopicSet {
    let mode = ConnectionMode::for_org(org);
    let topic = |template: &str| match mode {
        ConnectionMode::DirectCloud => template.to_string(),
        ConnectionMode::Gateway => to_gateway_topic(template, dev_type, dev_id),
    };

    TopicSet {
        mode,
        publish: topic(PUBLISH_TEMPLATE),
        info: topic(INFO_TEMPLATE),
        command: topic(COMMAND_TEMPLATE),
        response: topic(RESPONSE_TEMPLATE),
        manage: topic(MANAGE_TEMPLATE),
        update: topic(UPDATE_TEMPLATE),
        reboot: topic(REBOOT_TEMPLATE),
        reset: topic(RESET_TEMPLATE),
    }
}

/// Inserts `/type/<devType>/id/<devId>` after the first segment of `template`.
pub fn to_gateway_topic(template: &str, dev_type: &str, dev_id: &str) -> String {
    match template.split_once('/') {
        Some((prefix, rest)) => format!("{prefix}/type/{dev_type}/id/{dev_id}/{rest}"),
        None => format!("{template}/type/{dev_type}/id/{dev_id}"),
    }
}
