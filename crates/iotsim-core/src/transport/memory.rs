//! In-process broker.
//!
//! Routes messages between sessions opened in the same process. Useful for
//! running a simulation without an external broker and for driving the
//! harness deterministically in tests: connection refusal, silent brokers and
//! broker-initiated disconnects can all be scripted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    topic_matches, ConnectReturn, QoS, SessionOptions, Transport, TransportClient, TransportEvent,
    TransportEventLoop,
};
use crate::error::{PublishError, TransportError};

/// How the broker answers new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    /// Accept every connection.
    #[default]
    Accept,
    /// Refuse every connection with the given return code.
    Refuse(ConnectReturn),
    /// Never answer the connect handshake.
    Silent,
}

struct Session {
    client_id: String,
    tx: mpsc::UnboundedSender<TransportEvent>,
    filters: Vec<String>,
}

#[derive(Default)]
struct BrokerState {
    behavior: ConnectBehavior,
    sessions: HashMap<u64, Session>,
    /// Senders for sessions that were never answered, kept so their event loops stay pending.
    unanswered: Vec<mpsc::UnboundedSender<TransportEvent>>,
    next_session_id: u64,
    next_pkid: u16,
}

impl BrokerState {
    fn route(&self, topic: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for session in self.sessions.values() {
            if session.filters.iter().any(|f| topic_matches(f, topic))
                && session
                    .tx
                    .send(TransportEvent::Message {
                        topic: topic.to_string(),
                        payload: payload.to_vec(),
                    })
                    .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    fn next_pkid(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.wrapping_add(1).max(1);
        self.next_pkid
    }
}

/// In-process pub/sub broker. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: ConnectBehavior) -> Self {
        let broker = Self::new();
        broker.set_behavior(behavior);
        broker
    }

    /// Change how subsequent connections are answered.
    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        self.state.lock().behavior = behavior;
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Number of sessions a message on `topic` would be delivered to.
    pub fn matching_sessions(&self, topic: &str) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.filters.iter().any(|f| topic_matches(f, topic)))
            .count()
    }

    /// Sessions still waiting on a handshake the broker never answers.
    pub fn pending_handshakes(&self) -> usize {
        let mut state = self.state.lock();
        state.unanswered.retain(|tx| !tx.is_closed());
        state.unanswered.len()
    }

    /// Inject a message from outside any session. Returns the number of deliveries.
    pub fn publish_raw(&self, topic: &str, payload: impl AsRef<[u8]>) -> usize {
        self.state.lock().route(topic, payload.as_ref())
    }

    /// Drop a client's session from the broker side, as a network failure would.
    pub fn disconnect_client(&self, client_id: &str) -> bool {
        let mut state = self.state.lock();
        let id = state
            .sessions
            .iter()
            .find(|(_, s)| s.client_id == client_id)
            .map(|(id, _)| *id);

        match id.and_then(|id| state.sessions.remove(&id)) {
            Some(session) => {
                let _ = session.tx.send(TransportEvent::Disconnected { clean: false });
                true
            }
            None => false,
        }
    }
}

impl Transport for MemoryBroker {
    fn open(
        &self,
        options: &SessionOptions,
    ) -> (Arc<dyn TransportClient>, Box<dyn TransportEventLoop>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.unanswered.retain(|tx| !tx.is_closed());
        state.next_session_id += 1;
        let session_id = state.next_session_id;

        match state.behavior {
            ConnectBehavior::Accept => {
                let _ = tx.send(TransportEvent::ConnAck(ConnectReturn::Success));
                state.sessions.insert(
                    session_id,
                    Session {
                        client_id: options.client_id.clone(),
                        tx,
                        filters: Vec::new(),
                    },
                );
            }
            ConnectBehavior::Refuse(code) => {
                let _ = tx.send(TransportEvent::ConnAck(code));
            }
            ConnectBehavior::Silent => state.unanswered.push(tx),
        }

        (
            Arc::new(MemoryClient {
                state: self.state.clone(),
                session_id,
            }),
            Box::new(MemoryEventLoop { rx }),
        )
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryClient {
    state: Arc<Mutex<BrokerState>>,
    session_id: u64,
}

#[async_trait]
impl TransportClient for MemoryClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        let mut state = self.state.lock();
        let own_tx = match state.sessions.get(&self.session_id) {
            Some(session) => session.tx.clone(),
            None => return Err(PublishError::SessionClosed),
        };

        state.route(topic, &payload);

        if qos != QoS::AtMostOnce {
            let pkid = state.next_pkid();
            let _ = own_tx.send(TransportEvent::PubAck { pkid });
        }
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str, _qos: QoS) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(&self.session_id)
            .ok_or(TransportError::Closed)?;
        session.filters.push(topic_filter.to_string());
        let _ = session.tx.send(TransportEvent::SubAck);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(session) = self.state.lock().sessions.remove(&self.session_id) {
            let _ = session.tx.send(TransportEvent::Disconnected { clean: true });
        }
        Ok(())
    }
}

struct MemoryEventLoop {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl TransportEventLoop for MemoryEventLoop {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}
