//! # Broker Session Module
//!
//! The session lifecycle is a plain enum with one pure transition function. Keeping
//! the table free of I/O means every edge can be checked without a broker, and the
//! [`supervisor::SessionSupervisor`] only has to map broker results onto events.
//!
//! ```text
//! Disconnected ─network up─▶ TransportConnecting ─opened─▶ TransportConnected
//!      ▲                           │failed                        │auth requested
//!      │◀──────────────────────────┘                              ▼
//!      │◀──rejected (protocol | transport)──────────── AuthenticatingSession
//!      │                                                          │accepted
//!      │                                                          ▼
//!      │◀──subscription aborted── Subscribing ◀─started── SessionEstablished
//!      │                              │all subscribed
//!      │                              ▼
//!      └───────network down / drop─ Ready
//! ```

pub mod supervisor;

use crate::mqtt::message_manager::MessageError;
use crate::mqtt::BrokerError;
use crate::network::NetworkError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    TransportConnecting,
    TransportConnected,
    AuthenticatingSession,
    SessionEstablished,
    Subscribing,
    Ready,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    NetworkUp,
    TransportOpened,
    TransportFailed,
    AuthRequested,
    Accepted,
    RejectedByBroker,
    RejectedByTransport,
    SubscribeStarted,
    Subscribed,
    SubscribeAborted,
    TransportDropped,
    NetworkDown,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No transition from {from} on {event:?}")]
    InvalidTransition {
        from: SessionState,
        event: SessionEvent,
    },

    #[error("Session is not ready (state {0})")]
    NotReady(SessionState),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Applies `event` to `from`. Losing the network or the transport is valid from every
/// state and always lands in Disconnected.
pub fn transition(from: SessionState, event: SessionEvent) -> Result<SessionState, SessionError> {
    use SessionEvent as E;
    use SessionState as S;

    let to = match (from, event) {
        (_, E::NetworkDown | E::TransportDropped) => S::Disconnected,
        (S::Disconnected, E::NetworkUp) => S::TransportConnecting,
        (S::TransportConnecting, E::TransportOpened) => S::TransportConnected,
        (S::TransportConnecting, E::TransportFailed) => S::Disconnected,
        (S::TransportConnected, E::AuthRequested) => S::AuthenticatingSession,
        (S::AuthenticatingSession, E::Accepted) => S::SessionEstablished,
        (S::AuthenticatingSession, E::RejectedByBroker | E::RejectedByTransport) => {
            S::Disconnected
        }
        (S::SessionEstablished, E::SubscribeStarted) => S::Subscribing,
        (S::Subscribing, E::Subscribed) => S::Ready,
        (S::Subscribing, E::SubscribeAborted) => S::Disconnected,
        (from, event) => return Err(SessionError::InvalidTransition { from, event }),
    };
    Ok(to)
}
