//! # MQTT Integration Module
//!
//! Everything the agent needs to talk to its broker.
//!
//! ```text
//! mqtt/
//! ├── topics.rs           - Topic namespace, direct-cloud and gateway forms
//! ├── config.rs           - Connection parameters derived from the device identity
//! ├── message_manager.rs  - Inbound command parsing and outbound payload builders
//! └── mqtt_handler.rs     - rumqttc-backed implementation of [`Broker`]
//! ```
//!
//! The session supervisor only sees the [`Broker`] trait. It drives the connection step
//! by step (raw transport, session, each subscription) so it can tell a transport
//! failure from a protocol rejection and react differently to each.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod topics;

use config::MqttConfig;
use thiserror::Error;

/// Payloads larger than this are refused before they reach the wire.
pub const MAX_PAYLOAD: usize = 2048;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    /// Socket level failure: refused, reset, timed out or TLS broken
    #[error("Transport error: {0}")]
    Transport(String),

    /// The broker answered CONNECT with a non-zero return code
    #[error("Broker rejected session: {0}")]
    Rejected(String),

    #[error("No session is open")]
    NotConnected,

    #[error("Subscription to {0} refused")]
    SubscriptionRefused(String),
}

impl BrokerError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// A publish received from the broker, before any parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Broker session capability.
///
/// Calls are made in lifecycle order: `open_transport`, `connect_session`, then any
/// number of `subscribe`/`publish`/`poll`, and finally `close`. After an error the
/// caller closes and starts over from `open_transport`.
pub trait Broker {
    /// Checks the raw transport to `host:port` can be opened.
    async fn open_transport(&mut self, host: &str, port: u16) -> Result<(), BrokerError>;

    /// Starts an MQTT session to `host` and waits for the broker's answer.
    async fn connect_session(&mut self, host: &str, config: &MqttConfig)
        -> Result<(), BrokerError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Waits a short window for the next inbound publish.
    async fn poll(&mut self) -> Result<Option<RawMessage>, BrokerError>;

    fn is_connected(&self) -> bool;

    async fn close(&mut self);
}
