//! MQTT 3.1.1 transport backed by `rumqttc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError as MqttConnectionError, Event, EventLoop,
    MqttOptions, Outgoing, Packet, QoS,
};

use super::{
    ConnectReturn, SessionOptions, Transport, TransportClient, TransportEvent, TransportEventLoop,
};
use crate::error::{PublishError, TransportError};

/// Capacity of the request channel between client and event loop.
const REQUEST_CAPACITY: usize = 10;

/// Opens `rumqttc` sessions against one broker.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    host: String,
    port: u16,
}

impl MqttTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Transport for MqttTransport {
    fn open(
        &self,
        options: &SessionOptions,
    ) -> (Arc<dyn TransportClient>, Box<dyn TransportEventLoop>) {
        let mut mqttoptions = MqttOptions::new(&options.client_id, &self.host, self.port);
        mqttoptions.set_keep_alive(options.keep_alive);
        mqttoptions.set_clean_session(options.clean_session);

        let (client, eventloop) = AsyncClient::new(mqttoptions, REQUEST_CAPACITY);
        let disconnect_requested = Arc::new(AtomicBool::new(false));

        (
            Arc::new(MqttClient {
                inner: client,
                disconnect_requested: disconnect_requested.clone(),
            }),
            Box::new(MqttEventLoop {
                inner: eventloop,
                disconnect_requested,
            }),
        )
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct MqttClient {
    inner: AsyncClient,
    disconnect_requested: Arc<AtomicBool>,
}

#[async_trait]
impl TransportClient for MqttClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        self.inner
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| match e {
                // The request channel only fails once the event loop is gone.
                ClientError::Request(_) => PublishError::SessionClosed,
                other => PublishError::TransportRejected(other.to_string()),
            })
    }

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.inner
            .subscribe(topic_filter, qos)
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnect_requested.store(true, Ordering::SeqCst);
        self.inner
            .disconnect()
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

struct MqttEventLoop {
    inner: EventLoop,
    disconnect_requested: Arc<AtomicBool>,
}

#[async_trait]
impl TransportEventLoop for MqttEventLoop {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        match self.inner.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                Ok(TransportEvent::ConnAck(map_return_code(ack.code)))
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => Ok(TransportEvent::PubAck { pkid: ack.pkid }),
            Ok(Event::Incoming(Packet::SubAck(_))) => Ok(TransportEvent::SubAck),
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                Ok(TransportEvent::Disconnected { clean: false })
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                Ok(TransportEvent::Disconnected { clean: true })
            }
            Ok(_) => Ok(TransportEvent::Other),
            Err(MqttConnectionError::ConnectionRefused(code)) => {
                Ok(TransportEvent::ConnAck(map_return_code(code)))
            }
            Err(_) if self.disconnect_requested.load(Ordering::SeqCst) => {
                Ok(TransportEvent::Disconnected { clean: true })
            }
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }
}

fn map_return_code(code: ConnectReturnCode) -> ConnectReturn {
    match code {
        ConnectReturnCode::Success => ConnectReturn::Success,
        ConnectReturnCode::RefusedProtocolVersion => ConnectReturn::RefusedProtocolVersion,
        ConnectReturnCode::BadClientId => ConnectReturn::BadClientId,
        ConnectReturnCode::ServiceUnavailable => ConnectReturn::ServiceUnavailable,
        ConnectReturnCode::BadUserNamePassword => ConnectReturn::BadCredentials,
        ConnectReturnCode::NotAuthorized => ConnectReturn::NotAuthorized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let transport = MqttTransport::new("broker.local", 1884);
        assert_eq!(transport.describe(), "broker.local:1884");
    }

    #[test]
    fn test_return_code_mapping() {
        assert_eq!(
            map_return_code(ConnectReturnCode::BadUserNamePassword),
            ConnectReturn::BadCredentials
        );
        assert_eq!(map_return_code(ConnectReturnCode::Success), ConnectReturn::Success);
    }

    #[tokio::test]
    #[ignore] // Requires MQTT broker
    async fn test_connect_local_broker() {
        let transport = MqttTransport::new("localhost", 1883);
        let (_client, mut eventloop) = transport.open(&SessionOptions::new("iotsim-test"));
        let event = eventloop.poll().await.unwrap();
        assert_eq!(event, TransportEvent::ConnAck(ConnectReturn::Success));
    }
}
