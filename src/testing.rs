//! Capability doubles shared by the unit tests.

use crate::command::{DeviceApp, Uplink};
use crate::mqtt::config::MqttConfig;
use crate::mqtt::message_manager::InboundCommand;
use crate::mqtt::{Broker, BrokerError, RawMessage};
use crate::network::{NetworkError, Resolver, WifiCredentials, WifiRadio};
use crate::platform::{FirmwareUpdater, PowerControl, UpdateOutcome};
use crate::session::SessionError;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MockPower {
    reboots: AtomicUsize,
}

impl MockPower {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }
}

impl PowerControl for MockPower {
    fn hard_reboot(&self) {
        self.reboots.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockResolver {
    table: HashMap<String, IpAddr>,
}

impl MockResolver {
    pub fn with(mut self, host: &str, ip: &str) -> Self {
        self.table.insert(host.to_string(), ip.parse().unwrap());
        self
    }
}

impl Resolver for MockResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, NetworkError> {
        if let Ok(ip) = host.parse() {
            return Ok(ip);
        }
        self.table
            .get(host)
            .copied()
            .ok_or_else(|| NetworkError::Resolve {
                host: host.to_string(),
                reason: "unknown host".to_string(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct MockUpdater {
    outcome: UpdateOutcome,
    urls: Arc<Mutex<Vec<String>>>,
}

impl MockUpdater {
    pub fn new(outcome: UpdateOutcome) -> Self {
        Self {
            outcome,
            urls: Arc::default(),
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl FirmwareUpdater for MockUpdater {
    async fn apply(&mut self, url: &str) -> UpdateOutcome {
        self.urls.lock().unwrap().push(url.to_string());
        self.outcome
    }
}

#[derive(Debug, Default)]
pub struct MockUplink {
    pub published: Vec<Value>,
    pub interval: Option<Duration>,
}

impl Uplink for MockUplink {
    async fn publish_info(&mut self, payload: &Value) -> Result<(), SessionError> {
        self.published.push(payload.clone());
        Ok(())
    }

    fn set_publish_interval(&mut self, interval: Duration) {
        self.interval = Some(interval);
    }
}

#[derive(Debug, Default)]
pub struct RecordingApp {
    pub status: Map<String, Value>,
    pub commands: Vec<String>,
    pub metadata: Vec<Map<String, Value>>,
}

impl RecordingApp {
    pub fn with_status(status: Value) -> Self {
        Self {
            status: status.as_object().cloned().unwrap_or_default(),
            ..Self::default()
        }
    }
}

impl DeviceApp for RecordingApp {
    fn collect_status(&mut self) -> Map<String, Value> {
        self.status.clone()
    }

    async fn handle_command<U: Uplink>(&mut self, command: &InboundCommand, _uplink: &mut U) {
        self.commands.push(command.topic.clone());
    }

    fn metadata_updated(&mut self, meta: &Map<String, Value>) {
        self.metadata.push(meta.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    Begin(String),
    Disconnect,
}

#[derive(Debug, Default)]
struct RadioState {
    // is_associated answers false this many more times
    unassociated_polls: u32,
    polls: u32,
    calls: Vec<RadioCall>,
}

#[derive(Debug, Clone, Default)]
pub struct MockRadio {
    inner: Arc<Mutex<RadioState>>,
}

impl MockRadio {
    pub fn associating_after(polls: u32) -> Self {
        let radio = Self::default();
        radio.drop_link(polls);
        radio
    }

    pub fn drop_link(&self, polls: u32) {
        self.inner.lock().unwrap().unassociated_polls = polls;
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn associated_polls(&self) -> u32 {
        self.inner.lock().unwrap().polls
    }
}

impl WifiRadio for MockRadio {
    async fn begin(&mut self, credentials: &WifiCredentials) -> Result<(), NetworkError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(RadioCall::Begin(credentials.ssid.clone()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), NetworkError> {
        self.inner.lock().unwrap().calls.push(RadioCall::Disconnect);
        Ok(())
    }

    async fn is_associated(&mut self) -> bool {
        let mut state = self.inner.lock().unwrap();
        state.polls += 1;
        if state.unassociated_polls > 0 {
            state.unassociated_polls -= 1;
            false
        } else {
            true
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    OpenTransport(String, u16),
    /// host and client id
    Connect(String, String),
    Close,
}

#[derive(Debug, Default)]
struct BrokerState {
    calls: Vec<BrokerCall>,
    transport_failures: u32,
    session_errors: VecDeque<BrokerError>,
    subscribe_fail_at: Option<usize>,
    publish_fails: bool,
    dropped: bool,
    connected: bool,
    subscriptions: Vec<String>,
    published: Vec<(String, Value)>,
    inbound: VecDeque<RawMessage>,
}

/// Scripted broker. Subscriptions and publishes are recorded separately from the
/// connection calls.
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn fail_transport(&self, times: u32) {
        self.inner.lock().unwrap().transport_failures = times;
    }

    pub fn reject_session(&self, error: BrokerError) {
        self.inner.lock().unwrap().session_errors.push_back(error);
    }

    pub fn fail_subscription_at(&self, index: usize) {
        self.inner.lock().unwrap().subscribe_fail_at = Some(index);
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.inner.lock().unwrap().publish_fails = fail;
    }

    pub fn drop_connection(&self) {
        self.inner.lock().unwrap().dropped = true;
    }

    pub fn push_inbound(&self, topic: &str, payload: &str) {
        self.inner.lock().unwrap().inbound.push_back(RawMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().unwrap().subscriptions.clone()
    }

    /// Published messages with their payloads parsed back into JSON
    pub fn published(&self) -> Vec<(String, Value)> {
        self.inner.lock().unwrap().published.clone()
    }
}

impl Broker for MockBroker {
    async fn open_transport(&mut self, host: &str, port: u16) -> Result<(), BrokerError> {
        let mut state = self.inner.lock().unwrap();
        state
            .calls
            .push(BrokerCall::OpenTransport(host.to_string(), port));
        if state.transport_failures > 0 {
            state.transport_failures -= 1;
            return Err(BrokerError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn connect_session(
        &mut self,
        host: &str,
        config: &MqttConfig,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(BrokerCall::Connect(
            host.to_string(),
            config.client_id.clone(),
        ));
        if let Some(error) = state.session_errors.pop_front() {
            return Err(error);
        }
        state.connected = true;
        state.dropped = false;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.inner.lock().unwrap();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if state.subscribe_fail_at == Some(state.subscriptions.len()) {
            return Err(BrokerError::SubscriptionRefused(topic.to_string()));
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.inner.lock().unwrap();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if state.publish_fails {
            return Err(BrokerError::Transport("broken pipe".to_string()));
        }
        let value = serde_json::from_slice(payload).unwrap();
        state.published.push((topic.to_string(), value));
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<RawMessage>, BrokerError> {
        {
            let mut state = self.inner.lock().unwrap();
            if !state.connected {
                return Err(BrokerError::NotConnected);
            }
            if state.dropped {
                state.connected = false;
                return Err(BrokerError::Transport("connection reset".to_string()));
            }
            if let Some(message) = state.inbound.pop_front() {
                return Ok(Some(message));
            }
        }
        // poll window
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(None)
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    async fn close(&mut self) {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(BrokerCall::Close);
        state.connected = false;
    }
}
