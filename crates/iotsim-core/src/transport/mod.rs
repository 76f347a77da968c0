//! Pub/sub transport abstraction.
//!
//! A transport opens a session as a pair: a [`TransportClient`] used to issue
//! requests (publish, subscribe, disconnect) and a [`TransportEventLoop`] that
//! must be polled in the background to drive network I/O and deliver
//! notifications. This mirrors the `AsyncClient` / `EventLoop` split of
//! `rumqttc`.
//!
//! ## Implementations
//!
//! | Transport | Use |
//! |-----------|-----|
//! | [`MqttTransport`] | Real MQTT 3.1.1 broker over TCP |
//! | [`MemoryBroker`] | In-process broker for tests and offline demos |

pub mod memory;
pub mod mqtt;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ConnectionError, PublishError, TransportError};

pub use memory::{ConnectBehavior, MemoryBroker};
pub use mqtt::MqttTransport;
pub use rumqttc::QoS;

/// Connect result carried by a CONNACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturn {
    Success,
    RefusedProtocolVersion,
    BadClientId,
    ServiceUnavailable,
    BadCredentials,
    NotAuthorized,
}

impl ConnectReturn {
    /// Numeric return code as defined by MQTT 3.1.1.
    pub fn code(&self) -> u8 {
        match self {
            ConnectReturn::Success => 0,
            ConnectReturn::RefusedProtocolVersion => 1,
            ConnectReturn::BadClientId => 2,
            ConnectReturn::ServiceUnavailable => 3,
            ConnectReturn::BadCredentials => 4,
            ConnectReturn::NotAuthorized => 5,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ConnectReturn::Success => "connection accepted",
            ConnectReturn::RefusedProtocolVersion => "incorrect protocol version",
            ConnectReturn::BadClientId => "invalid client identifier",
            ConnectReturn::ServiceUnavailable => "server unavailable",
            ConnectReturn::BadCredentials => "bad username or password",
            ConnectReturn::NotAuthorized => "not authorized",
        }
    }

    /// Map a refusal onto the connection error taxonomy. `None` for success.
    pub fn into_error(self) -> Option<ConnectionError> {
        let detail = format!("RC {}: {}", self.code(), self.description());
        match self {
            ConnectReturn::Success => None,
            ConnectReturn::RefusedProtocolVersion => Some(ConnectionError::ProtocolMismatch(detail)),
            ConnectReturn::BadCredentials | ConnectReturn::NotAuthorized => {
                Some(ConnectionError::Unauthorized(detail))
            }
            ConnectReturn::BadClientId | ConnectReturn::ServiceUnavailable => {
                Some(ConnectionError::Refused(detail))
            }
        }
    }
}

/// Notification produced by polling a session's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Result of the connect handshake.
    ConnAck(ConnectReturn),
    /// Broker acknowledged a QoS 1 publish.
    PubAck { pkid: u16 },
    /// Broker acknowledged a subscription.
    SubAck,
    /// Inbound message on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// Session ended. `clean` is true when the client asked for it.
    Disconnected { clean: bool },
    /// Anything the harness does not care about (pings, outgoing packets).
    Other,
}

/// Per-session connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
}

impl SessionOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(crate::config::defaults::KEEP_ALIVE_SECS),
            clean_session: true,
        }
    }
}

/// Request side of a session.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Queue a publish. `Ok` means accepted locally, not acknowledged.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError>;

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Notification side of a session. Must be polled for the session to make progress.
#[async_trait]
pub trait TransportEventLoop: Send {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError>;
}

/// Factory for sessions against one broker.
pub trait Transport: Send + Sync {
    /// Start connecting. The connect result is reported through the event loop.
    fn open(
        &self,
        options: &SessionOptions,
    ) -> (Arc<dyn TransportClient>, Box<dyn TransportEventLoop>);

    /// Human-readable target, e.g. `localhost:1883`.
    fn describe(&self) -> String;
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');

    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            exact => {
                if topic_levels.next() != Some(exact) {
                    return false;
                }
            }
        }
    }

    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("iot/environment/#", "iot/environment/park_north/humidity"));
        assert!(topic_matches("iot/environment/#", "iot/environment"));
        assert!(topic_matches("iot/+/park_north/+", "iot/environment/park_north/humidity"));
        assert!(topic_matches("a/b", "a/b"));

        assert!(!topic_matches("iot/environment/#", "iot/other/x"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
    }

    #[test]
    fn test_connect_return_mapping() {
        assert_eq!(ConnectReturn::Success.into_error(), None);
        assert!(matches!(
            ConnectReturn::RefusedProtocolVersion.into_error(),
            Some(ConnectionError::ProtocolMismatch(_))
        ));
        assert!(matches!(
            ConnectReturn::NotAuthorized.into_error(),
            Some(ConnectionError::Unauthorized(_))
        ));
        assert!(matches!(
            ConnectReturn::BadCredentials.into_error(),
            Some(ConnectionError::Unauthorized(_))
        ));
        assert!(matches!(
            ConnectReturn::ServiceUnavailable.into_error(),
            Some(ConnectionError::Refused(_))
        ));
    }
}
