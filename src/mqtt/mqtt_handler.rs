use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::config::MqttConfig;
use super::{Broker, BrokerError, RawMessage};

const REQUEST_CAPACITY: usize = 10;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
enum ConnectionState {
    #[default]
    Disconnected,
    TransportOpen,
    Connected,
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
    ack_timeout: Duration,
}

/// [`Broker`] backed by a rumqttc client and event loop.
///
/// rumqttc only makes progress while its event loop is polled, so every operation here
/// drives the loop itself until the expected acknowledgement shows up. Publishes that
/// arrive in the meantime are queued and handed out by [`Broker::poll`].
pub struct MqttHandler {
    state: ConnectionState,
    session: Option<Session>,
    pending: VecDeque<RawMessage>,
    poll_window: Duration,
    transport_timeout: Duration,
}

impl MqttHandler {
    pub fn new(poll_window: Duration, transport_timeout: Duration) -> Self {
        MqttHandler {
            state: ConnectionState::Disconnected,
            session: None,
            pending: VecDeque::new(),
            poll_window,
            transport_timeout,
        }
    }

    async fn options(host: &str, config: &MqttConfig) -> MqttOptions {
        let mut options = MqttOptions::new(config.client_id.clone(), host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let Some((user, password)) = &config.credentials {
            options.set_credentials(user.clone(), password.clone());
        }

        if config.mode.is_secure() {
            options.set_transport(tls_transport(config.ca_file.as_deref()).await);
        }

        options
    }

    /// Drives the event loop until `accept` yields a value or the session's ack
    /// timeout runs out.
    async fn drive_until<T>(
        &mut self,
        mut accept: impl FnMut(&Event) -> Option<Result<T, BrokerError>>,
    ) -> Result<T, BrokerError> {
        let session = self.session.as_mut().ok_or(BrokerError::NotConnected)?;
        let deadline = Instant::now() + session.ack_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = match timeout(remaining, session.eventloop.poll()).await {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(classify(e));
                }
                Err(_) => {
                    return Err(BrokerError::Transport(
                        "Timed out waiting for broker".to_string(),
                    ))
                }
            };

            match &event {
                Event::Incoming(Packet::Publish(publish)) => {
                    self.pending.push_back(RawMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    });
                }
                Event::Incoming(Packet::Disconnect) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(BrokerError::Transport(
                        "Broker closed the session".to_string(),
                    ));
                }
                _ => {}
            }

            if let Some(result) = accept(&event) {
                return result;
            }
        }
    }
}

/// TLS with the configured CA file, or the default root store when the file is not
/// configured or cannot be read.
async fn tls_transport(ca_file: Option<&Path>) -> Transport {
    let Some(path) = ca_file else {
        return Transport::tls_with_default_config();
    };

    match tokio::fs::read(path).await {
        Ok(ca) => Transport::tls(ca, None, None),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(
                "CA file {} not found, using the default root store",
                path.display()
            );
            Transport::tls_with_default_config()
        }
        Err(e) => {
            warn!(
                "Unable to read CA file {}: {}, using the default root store",
                path.display(),
                e
            );
            Transport::tls_with_default_config()
        }
    }
}

fn classify(error: ConnectionError) -> BrokerError {
    match error {
        ConnectionError::ConnectionRefused(code) => BrokerError::Rejected(format!("{code:?}")),
        other => BrokerError::Transport(other.to_string()),
    }
}

impl Broker for MqttHandler {
    /// Checks that `host:port` accepts TCP connections and drops the probe socket.
    ///
    /// rumqttc dials its own connection in [`Broker::connect_session`], so
    /// `TransportOpen` only records that the broker was reachable. Reopening the
    /// transport after a rejection repeats this check.
    async fn open_transport(&mut self, host: &str, port: u16) -> Result<(), BrokerError> {
        debug!("Opening transport to {}:{}", host, port);
        match timeout(self.transport_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_probe)) => {
                self.state = ConnectionState::TransportOpen;
                Ok(())
            }
            Ok(Err(e)) => Err(BrokerError::Transport(format!(
                "Unable to reach {host}:{port}: {e}"
            ))),
            Err(_) => Err(BrokerError::Transport(format!(
                "Timed out reaching {host}:{port}"
            ))),
        }
    }

    async fn connect_session(
        &mut self,
        host: &str,
        config: &MqttConfig,
    ) -> Result<(), BrokerError> {
        let options = Self::options(host, config).await;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        self.pending.clear();
        self.session = Some(Session {
            client,
            eventloop,
            ack_timeout: config.ack_timeout,
        });

        let result = self
            .drive_until(|event| match event {
                Event::Incoming(Packet::ConnAck(_)) => Some(Ok(())),
                _ => None,
            })
            .await;

        match result {
            Ok(()) => {
                info!("MQTT session established as {}", config.client_id);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.session = None;
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let session = self.session.as_ref().ok_or(BrokerError::NotConnected)?;
        session
            .client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let refused = topic.to_string();
        self.drive_until(|event| match event {
            Event::Incoming(Packet::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Some(Err(BrokerError::SubscriptionRefused(refused.clone())))
                } else {
                    Some(Ok(()))
                }
            }
            _ => None,
        })
        .await?;

        debug!("Subscribed to {}", topic);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let session = self.session.as_ref().ok_or(BrokerError::NotConnected)?;
        session
            .client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        self.drive_until(|event| match event {
            Event::Outgoing(Outgoing::Publish(_)) => Some(Ok(())),
            _ => None,
        })
        .await
    }

    async fn poll(&mut self) -> Result<Option<RawMessage>, BrokerError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }

        let session = self.session.as_mut().ok_or(BrokerError::NotConnected)?;
        match timeout(self.poll_window, session.eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => Ok(Some(RawMessage {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            })),
            Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                self.state = ConnectionState::Disconnected;
                Err(BrokerError::Transport(
                    "Broker closed the session".to_string(),
                ))
            }
            Ok(Ok(_)) => Ok(None),
            Ok(Err(e)) => {
                warn!("MQTT event loop failed: {}", e);
                self.state = ConnectionState::Disconnected;
                Err(classify(e))
            }
            Err(_) => Ok(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.session.is_some()
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.client.try_disconnect() {
                debug!("Disconnect request not queued: {}", e);
            }
        }
        self.pending.clear();
        self.state = ConnectionState::Disconnected;
    }
}
