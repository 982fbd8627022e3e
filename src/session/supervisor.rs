use super::{transition, SessionError, SessionEvent, SessionState};
use crate::command::{DeviceApp, Uplink};
use crate::mqtt::config::MqttConfig;
use crate::mqtt::message_manager::{self, encode};
use crate::mqtt::topics::{ConnectionMode, TopicSet};
use crate::mqtt::{Broker, BrokerError, RawMessage};
use crate::network::Resolver;
use crate::watchdog::WatchdogTimer;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Owns the broker session and walks it through the session table.
pub struct SessionSupervisor<B, N> {
    broker: B,
    resolver: N,
    mqtt: MqttConfig,
    topics: TopicSet,
    state: SessionState,
    retry_backoff: Duration,
    publish_interval: Duration,
    // time of the last publish attempt, successful or not
    last_publish: Option<Instant>,
    timer: WatchdogTimer,
}

impl<B: Broker, N: Resolver> SessionSupervisor<B, N> {
    pub fn new(
        broker: B,
        resolver: N,
        mqtt: MqttConfig,
        topics: TopicSet,
        retry_backoff: Duration,
        publish_interval: Duration,
        timer: WatchdogTimer,
    ) -> Self {
        Self {
            broker,
            resolver,
            mqtt,
            topics,
            state: SessionState::Disconnected,
            retry_backoff,
            publish_interval,
            last_publish: None,
            timer,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready && self.broker.is_connected()
    }

    fn apply(&mut self, event: SessionEvent) {
        match transition(self.state, event) {
            Ok(next) => {
                debug!("Session {} -> {} on {:?}", self.state, next, event);
                self.state = next;
            }
            Err(e) => error!("{}", e),
        }
    }

    async fn backoff(&self) {
        info!("Retrying broker connection in {:?}", self.retry_backoff);
        tokio::time::sleep(self.retry_backoff).await;
    }

    async fn broker_host(&self) -> Result<String, SessionError> {
        match self.mqtt.mode {
            ConnectionMode::DirectCloud => Ok(self.mqtt.host.clone()),
            ConnectionMode::Gateway => {
                let ip = self.resolver.resolve(&self.mqtt.host).await?;
                Ok(ip.to_string())
            }
        }
    }

    /// One pass from Disconnected to Ready.
    ///
    /// On failure the session is Disconnected and the fixed backoff has already been
    /// slept, so the caller can simply try again.
    pub async fn establish(&mut self, meta: &Map<String, Value>) -> Result<(), SessionError> {
        if self.is_ready() {
            return Ok(());
        }
        if self.state != SessionState::Disconnected {
            self.drop_session(SessionEvent::TransportDropped).await;
        }

        self.apply(SessionEvent::NetworkUp);
        let host = match self.broker_host().await {
            Ok(host) => host,
            Err(e) => {
                warn!("Broker address unavailable: {}", e);
                self.apply(SessionEvent::TransportFailed);
                self.backoff().await;
                return Err(e);
            }
        };

        if let Err(e) = self.broker.open_transport(&host, self.mqtt.port).await {
            warn!("{} connection failed: {}", self.mqtt.mode, e);
            self.apply(SessionEvent::TransportFailed);
            self.backoff().await;
            return Err(e.into());
        }
        self.apply(SessionEvent::TransportOpened);

        self.apply(SessionEvent::AuthRequested);
        if let Err(e) = self.broker.connect_session(&host, &self.mqtt).await {
            if e.is_transport() {
                warn!("Session dropped during connect: {}, reopening socket", e);
                self.apply(SessionEvent::RejectedByTransport);
                self.broker.close().await;
                if let Err(e) = self.broker.open_transport(&host, self.mqtt.port).await {
                    debug!("Socket reopen failed: {}", e);
                }
            } else {
                warn!("MQ connection failed: {}", e);
                self.apply(SessionEvent::RejectedByBroker);
            }
            self.backoff().await;
            return Err(e.into());
        }
        self.apply(SessionEvent::Accepted);
        info!("MQ connected");

        self.apply(SessionEvent::SubscribeStarted);
        let subscriptions: Vec<String> = self
            .topics
            .command_subscriptions()
            .iter()
            .map(|topic| topic.to_string())
            .collect();
        for topic in &subscriptions {
            if let Err(e) = self.broker.subscribe(topic).await {
                warn!("Subscription to {} failed: {}", topic, e);
                self.drop_session(SessionEvent::SubscribeAborted).await;
                self.backoff().await;
                return Err(e.into());
            }
        }
        self.apply(SessionEvent::Subscribed);

        self.announce(meta).await;
        Ok(())
    }

    /// Publishes the metadata announcement and, once that went out, its info echo.
    async fn announce(&mut self, meta: &Map<String, Value>) {
        let announcement = message_manager::metadata_announcement(meta);
        info!("publishing device metadata: {}", announcement);
        match self.publish_to_manage(&announcement).await {
            Ok(()) => {
                let echo = message_manager::info_echo(&announcement["d"]);
                if let Err(e) = self.publish_info(&echo).await {
                    warn!("Unable to publish metadata echo: {}", e);
                }
            }
            Err(e) => warn!("Unable to publish device metadata: {}", e),
        }
    }

    async fn publish_to_manage(&mut self, payload: &Value) -> Result<(), SessionError> {
        let bytes = encode(payload)?;
        let result = self.broker.publish(&self.topics.manage, &bytes).await;
        self.check_publish(result).await
    }

    async fn check_publish(&mut self, result: Result<(), BrokerError>) -> Result<(), SessionError> {
        if let Err(e) = &result {
            if e.is_transport() {
                self.drop_session(SessionEvent::TransportDropped).await;
            }
        }
        result.map_err(SessionError::from)
    }

    async fn drop_session(&mut self, event: SessionEvent) {
        self.apply(event);
        self.broker.close().await;
    }

    /// Next inbound message, if the session is up and one arrives within the poll
    /// window.
    pub async fn poll_inbound(&mut self) -> Option<RawMessage> {
        if self.state != SessionState::Ready {
            return None;
        }
        match self.broker.poll().await {
            Ok(message) => message,
            Err(e) => {
                warn!("Broker session lost: {}", e);
                self.drop_session(SessionEvent::TransportDropped).await;
                None
            }
        }
    }

    pub async fn close(&mut self) {
        info!("Closing broker session");
        self.drop_session(SessionEvent::TransportDropped).await;
    }

    pub async fn on_network_down(&mut self) {
        if self.state != SessionState::Disconnected {
            info!("Network lost, closing broker session");
        }
        self.drop_session(SessionEvent::NetworkDown).await;
    }

    /// Publishes one telemetry document once the time since the last attempt exceeds
    /// the interval. Returns true when a publish succeeded.
    pub async fn publish_telemetry_if_due<A: DeviceApp>(&mut self, app: &mut A) -> bool {
        if self.state != SessionState::Ready || self.publish_interval.is_zero() {
            return false;
        }
        let due = self
            .last_publish
            .map_or(true, |at| at.elapsed() > self.publish_interval);
        if !due {
            return false;
        }
        self.last_publish = Some(Instant::now());

        let payload = message_manager::telemetry(app.collect_status());
        let bytes = match encode(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Telemetry not sent: {}", e);
                return false;
            }
        };

        let result = self.broker.publish(&self.topics.publish, &bytes).await;
        match self.check_publish(result).await {
            Ok(()) => {
                debug!("Telemetry published: {}", payload);
                self.timer.touch();
                true
            }
            Err(e) => {
                warn!("Telemetry publish failed: {}", e);
                false
            }
        }
    }
}

impl<B: Broker, N: Resolver> Uplink for SessionSupervisor<B, N> {
    async fn publish_info(&mut self, payload: &Value) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady(self.state));
        }
        let bytes = encode(payload)?;
        let result = self.broker.publish(&self.topics.info, &bytes).await;
        self.check_publish(result).await
    }

    fn set_publish_interval(&mut self, interval: Duration) {
        if interval != self.publish_interval {
            info!("Publish interval set to {:?}", interval);
        }
        self.publish_interval = interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSettings;
    use crate::mqtt::topics::derive_topics;
    use crate::persistence::provisioned_config;
    use crate::testing::{BrokerCall, MockBroker, MockResolver, RecordingApp};
    use serde_json::json;

    type Supervisor = SessionSupervisor<MockBroker, MockResolver>;

    fn supervisor(org: &str, broker: &MockBroker, timer: WatchdogTimer) -> Supervisor {
        let config = provisioned_config(org);
        let identity = config.identity().unwrap();
        let settings = BrokerSettings::default();
        let resolver = MockResolver::default().with("edge-gw.local", "192.168.4.2");

        SessionSupervisor::new(
            broker.clone(),
            resolver,
            MqttConfig::from_parts(&identity, &settings, None),
            derive_topics(&identity.org, &identity.dev_type, &identity.dev_id),
            settings.retry_backoff(),
            config.publish_interval(),
            timer,
        )
    }

    fn meta() -> Map<String, Value> {
        provisioned_config("acme01").meta
    }

    const CLOUD_HOST: &str = "acme01.messaging.internetofthings.ibmcloud.com";

    #[tokio::test(start_paused = true)]
    async fn direct_cloud_session_reaches_ready_and_announces() {
        let broker = MockBroker::default();
        let mut session = supervisor("acme01", &broker, WatchdogTimer::new());

        session.establish(&meta()).await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(
            broker.calls()[..2],
            [
                BrokerCall::OpenTransport(CLOUD_HOST.to_string(), 8883),
                BrokerCall::Connect(CLOUD_HOST.to_string(), "d:acme01:purifier:unit-7".to_string()),
            ]
        );
        assert_eq!(
            broker.subscriptions(),
            vec![
                "iotdm-1/response",
                "iotdm-1/mgmt/initiate/device/reboot",
                "iotdm-1/mgmt/initiate/device/factory_reset",
                "iotdm-1/device/update",
                "iot-2/cmd/+/fmt/+",
            ]
        );
        let expected_d = json!({"metadata": {"pubInterval": "5000"}, "supports": {"deviceActions": true}});
        assert_eq!(
            broker.published(),
            vec![
                ("iotdevice-1/mgmt/manage".to_string(), json!({"d": expected_d})),
                ("iot-2/evt/info/fmt/json".to_string(), json!({"info": expected_d})),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_session_resolves_broker_address() {
        let broker = MockBroker::default();
        let mut session = supervisor("edge-gw.local", &broker, WatchdogTimer::new());

        session.establish(&meta()).await.unwrap();

        assert_eq!(
            broker.calls()[..2],
            [
                BrokerCall::OpenTransport("192.168.4.2".to_string(), 1883),
                BrokerCall::Connect("192.168.4.2".to_string(), "d:purifier:unit-7".to_string()),
            ]
        );
        assert!(broker.subscriptions()[0].starts_with("iotdm-1/type/purifier/id/unit-7/"));
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_gateway_backs_off() {
        let broker = MockBroker::default();
        let mut session = supervisor("other-gw.local", &broker, WatchdogTimer::new());
        let start = Instant::now();

        assert!(session.establish(&meta()).await.is_err());

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(broker.calls().is_empty());
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_retries_from_the_top() {
        let broker = MockBroker::default();
        broker.fail_transport(1);
        let mut session = supervisor("acme01", &broker, WatchdogTimer::new());

        assert!(session.establish(&meta()).await.is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(broker.calls().len(), 1);

        session.establish(&meta()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_rejection_does_not_reopen_transport() {
        let broker = MockBroker::default();
        broker.reject_session(BrokerError::Rejected("NotAuthorized".to_string()));
        let mut session = supervisor("acme01", &broker, WatchdogTimer::new());
        let start = Instant::now();

        let err = session.establish(&meta()).await.unwrap_err();

        assert!(matches!(err, SessionError::Broker(BrokerError::Rejected(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(broker.calls().len(), 2);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_rejection_reopens_socket() {
        let broker = MockBroker::default();
        broker.reject_session(BrokerError::Transport("connection reset".to_string()));
        let mut session = supervisor("acme01", &broker, WatchdogTimer::new());

        session.establish(&meta()).await.unwrap_err();

        let calls = broker.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[2], BrokerCall::Close);
        assert_eq!(calls[3], BrokerCall::OpenTransport(CLOUD_HOST.to_string(), 8883));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_failure_disconnects_without_announcing() {
        let broker = MockBroker::default();
        broker.fail_subscription_at(2);
        let mut session = supervisor("acme01", &broker, WatchdogTimer::new());

        assert!(session.establish(&meta()).await.is_err());

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(broker.subscriptions().len(), 2);
        assert!(broker.published().is_empty());
        assert_eq!(broker.calls().last(), Some(&BrokerCall::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_follows_interval_and_touches_watchdog() {
        let broker = MockBroker::default();
        let timer = WatchdogTimer::new();
        let mut session = supervisor("acme01", &broker, timer.clone());
        let mut app = RecordingApp::with_status(json!({"temp": 21}));
        session.establish(&meta()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(session.publish_telemetry_if_due(&mut app).await);
        assert_eq!(timer.since_last_touch(), Duration::ZERO);
        assert!(!session.publish_telemetry_if_due(&mut app).await);

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert!(!session.publish_telemetry_if_due(&mut app).await);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(session.publish_telemetry_if_due(&mut app).await);

        let telemetry: Vec<_> = broker
            .published()
            .into_iter()
            .filter(|(topic, _)| topic == "iot-2/evt/status/fmt/json")
            .collect();
        assert_eq!(telemetry.len(), 2);
        assert_eq!(telemetry[0].1, json!({"d": {"temp": 21}}));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_never_publishes() {
        let broker = MockBroker::default();
        let mut session = supervisor("acme01", &broker, WatchdogTimer::new());
        let mut app = RecordingApp::default();
        session.establish(&meta()).await.unwrap();
        session.set_publish_interval(Duration::ZERO);

        assert!(!session.publish_telemetry_if_due(&mut app).await);
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_leaves_watchdog_untouched() {
        let broker = MockBroker::default();
        let timer = WatchdogTimer::new();
        let mut session = supervisor("acme01", &broker, timer.clone());
        let mut app = RecordingApp::default();
        session.establish(&meta()).await.unwrap();
        broker.fail_publishes(true);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!session.publish_telemetry_if_due(&mut app).await);

        assert_eq!(timer.since_last_touch(), Duration::from_secs(2));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_is_noticed_on_poll() {
        let broker = MockBroker::default();
        let mut session = supervisor("acme01", &broker, WatchdogTimer::new());
        session.establish(&meta()).await.unwrap();
        broker.push_inbound("iot-2/cmd/led/fmt/json", "{}");

        let message = session.poll_inbound().await.unwrap();
        assert_eq!(message.topic, "iot-2/cmd/led/fmt/json");

        broker.drop_connection();
        assert!(session.poll_inbound().await.is_none());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn info_requires_ready_session() {
        let broker = MockBroker::default();
        let mut session = supervisor("acme01", &broker, WatchdogTimer::new());

        let err = session.publish_info(&json!({"info": 1})).await.unwrap_err();
        assert!(matches!(err, SessionError::NotReady(SessionState::Disconnected)));

        session.establish(&meta()).await.unwrap();
        session.on_network_down().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!broker.is_connected());
    }
}
