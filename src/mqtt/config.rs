use super::topics::ConnectionMode;
use crate::config::{AgentConfig, BrokerSettings};
use crate::persistence::DeviceIdentity;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const TOKEN_USERNAME: &str = "use-token-auth";

/// Connection parameters for one device session.
#[derive(Clone, PartialEq)]
pub struct MqttConfig {
    pub mode: ConnectionMode,
    /// Broker host before resolution
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub ack_timeout: Duration,
    pub ca_file: Option<PathBuf>,
}

impl MqttConfig {
    pub fn for_device(identity: &DeviceIdentity, agent: &AgentConfig) -> Self {
        Self::from_parts(identity, &agent.broker, agent.ca_file.clone())
    }

    pub fn from_parts(
        identity: &DeviceIdentity,
        broker: &BrokerSettings,
        ca_file: Option<PathBuf>,
    ) -> Self {
        let mode = ConnectionMode::for_org(&identity.org);
        let (host, client_id, credentials) = match mode {
            ConnectionMode::DirectCloud => (
                format!("{}.{}", identity.org, broker.cloud_domain),
                format!(
                    "d:{}:{}:{}",
                    identity.org, identity.dev_type, identity.dev_id
                ),
                Some((TOKEN_USERNAME.to_string(), identity.token.clone())),
            ),
            ConnectionMode::Gateway => (
                identity.org.clone(),
                format!("d:{}:{}", identity.dev_type, identity.dev_id),
                None,
            ),
        };

        Self {
            mode,
            host,
            port: mode.port(),
            client_id,
            credentials,
            keep_alive: broker.keep_alive(),
            ack_timeout: broker.ack_timeout(),
            ca_file,
        }
    }
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("mode", &self.mode)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field(
                "username",
                &self.credentials.as_ref().map(|(user, _)| user.as_str()),
            )
            .field("keep_alive", &self.keep_alive)
            .field("ca_file", &self.ca_file)
            .finish()
    }
}
