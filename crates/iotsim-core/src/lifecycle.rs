//! Per-device connection state machine.
//!
//! ```text
//! Disconnected --connect()--> Connecting --CONNACK ok--> Connected
//!                                 |                          |
//!                   refused / timeout              disconnect() / broker drop
//!                                 v                          v
//!                           Disconnected <-------------------+
//! ```
//!
//! A [`ConnectionLifecycle`] opens a transport session, drives its event loop
//! on a background task and turns the asynchronous connect notification into
//! an awaitable `connect(timeout)`. Transport notifications other than the
//! connect result are forwarded to a [`SessionHandler`].
//!
//! The matching active counter (`active_publishers` or `active_subscribers`)
//! is incremented on entering `Connected` and decremented on leaving it,
//! exactly once per pair, whichever path leaves the state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::error::{ConnectionError, PublishError};
use crate::stats::{StatKey, Statistics};
use crate::transport::{
    QoS, SessionOptions, Transport, TransportClient, TransportEvent, TransportEventLoop,
};

/// How long `disconnect()` waits for the event loop to wind down.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Connection state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Which population a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Publisher,
    Subscriber,
    /// One-off reachability check. Not counted as an active device.
    Probe,
}

impl DeviceRole {
    fn active_key(&self) -> Option<StatKey> {
        match self {
            DeviceRole::Publisher => Some(StatKey::ActivePublishers),
            DeviceRole::Subscriber => Some(StatKey::ActiveSubscribers),
            DeviceRole::Probe => None,
        }
    }
}

/// Receives the notifications of a session's event loop.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Called once the broker accepted the connection, before the state
    /// becomes `Connected`. An error fails the connect instead.
    async fn on_connected(&self, _client: &dyn TransportClient) -> Result<(), ConnectionError> {
        Ok(())
    }

    /// Called for each publish acknowledgement.
    fn on_publish_ack(&self) {}

    /// Called for each inbound message.
    fn on_message(&self, _topic: &str, _payload: &[u8]) {}
}

/// Handler that ignores everything.
pub struct NoopHandler;

impl SessionHandler for NoopHandler {}

struct Shared {
    role: DeviceRole,
    stats: Arc<Statistics>,
    state: watch::Sender<ConnectionState>,
    active: AtomicBool,
    disconnect_requested: AtomicBool,
    failure: Mutex<Option<ConnectionError>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn mark_active(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            if let Some(key) = self.role.active_key() {
                self.stats.increment(key);
            }
        }
    }

    fn mark_inactive(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Some(key) = self.role.active_key() {
                self.stats.decrement(key);
            }
        }
    }

    /// Connected -> Disconnected, from the event loop.
    fn mark_disconnected(&self, clean: bool, reason: &str) {
        let was_connected = self.current() == ConnectionState::Connected;
        self.mark_inactive();
        self.set_state(ConnectionState::Disconnected);

        if clean || self.disconnect_requested.load(Ordering::SeqCst) {
            info!("Disconnected");
        } else if was_connected {
            warn!(reason, "Unexpected disconnect");
            self.stats.increment(StatKey::Errors);
        }
    }

    /// Connecting -> Disconnected, from the event loop.
    fn fail_connect(&self, error: ConnectionError) {
        *self.failure.lock() = Some(error);
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Owns one transport session and its background event loop.
pub struct ConnectionLifecycle {
    client_id: String,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn SessionHandler>,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    client: Option<Arc<dyn TransportClient>>,
    event_task: Option<JoinHandle<()>>,
}

impl ConnectionLifecycle {
    pub fn new(
        client_id: impl Into<String>,
        role: DeviceRole,
        transport: Arc<dyn Transport>,
        stats: Arc<Statistics>,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            client_id: client_id.into(),
            transport,
            handler,
            shared: Arc::new(Shared {
                role,
                stats,
                state: state_tx,
                active: AtomicBool::new(false),
                disconnect_requested: AtomicBool::new(false),
                failure: Mutex::new(None),
            }),
            state_rx,
            client: None,
            event_task: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait up to `timeout` for the state to leave `Connected`. Returns false
    /// if it is still `Connected` when the time runs out.
    pub async fn wait_until_disconnected(&self, timeout: Duration) -> bool {
        let mut state = self.subscribe_state();
        let left = matches!(
            tokio::time::timeout(timeout, state.wait_for(|s| *s != ConnectionState::Connected)).await,
            Ok(Ok(_))
        );
        left
    }

    /// Open a session and wait up to `timeout` for it to become `Connected`.
    ///
    /// On failure or timeout the background event loop is stopped before
    /// returning. Does not touch the `errors` counter; that is the caller's call.
    pub async fn connect(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        self.stop_event_loop();

        self.shared.disconnect_requested.store(false, Ordering::SeqCst);
        *self.shared.failure.lock() = None;
        self.shared.set_state(ConnectionState::Connecting);

        let (client, eventloop) = self.transport.open(&SessionOptions::new(&self.client_id));
        self.client = Some(client.clone());
        self.event_task = Some(tokio::spawn(
            drive(self.shared.clone(), self.handler.clone(), client, eventloop).in_current_span(),
        ));

        let state_rx = &mut self.state_rx;
        let waited = tokio::time::timeout(timeout, async move {
            state_rx
                .wait_for(|s| *s != ConnectionState::Connecting)
                .await
                .map(|s| *s)
                .ok()
        })
        .await;

        match waited {
            Ok(Some(ConnectionState::Connected)) => {
                debug!(client_id = %self.client_id, "Connection ready");
                Ok(())
            }
            Ok(_) => {
                self.stop_event_loop();
                let error = self.shared.failure.lock().take().unwrap_or_else(|| {
                    ConnectionError::Refused("session closed during handshake".to_string())
                });
                Err(error)
            }
            Err(_) => {
                self.stop_event_loop();
                Err(ConnectionError::Timeout(timeout))
            }
        }
    }

    /// Close the session. Safe to call in any state and more than once.
    pub async fn disconnect(&mut self) {
        self.shared.disconnect_requested.store(true, Ordering::SeqCst);

        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!(client_id = %self.client_id, error = %e, "Disconnect request not sent");
            }
        }

        if let Some(mut task) = self.event_task.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                debug!(client_id = %self.client_id, "Event loop did not stop in time, aborting");
                task.abort();
            }
        }

        self.shared.mark_inactive();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Publish through the open session.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        match &self.client {
            Some(client) => client.publish(topic, payload, qos).await,
            None => Err(PublishError::SessionClosed),
        }
    }

    fn stop_event_loop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.client = None;
        self.shared.mark_inactive();
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionLifecycle {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.shared.mark_inactive();
    }
}

async fn drive(
    shared: Arc<Shared>,
    handler: Arc<dyn SessionHandler>,
    client: Arc<dyn TransportClient>,
    mut eventloop: Box<dyn TransportEventLoop>,
) {
    loop {
        match eventloop.poll().await {
            Ok(TransportEvent::ConnAck(code)) => match code.into_error() {
                None => match handler.on_connected(client.as_ref()).await {
                    Ok(()) => {
                        shared.mark_active();
                        shared.set_state(ConnectionState::Connected);
                        info!("Connected");
                    }
                    Err(error) => {
                        warn!(error = %error, "Session setup failed");
                        if let Err(e) = client.disconnect().await {
                            debug!(error = %e, "Disconnect request not sent");
                        }
                        shared.fail_connect(error);
                        break;
                    }
                },
                Some(error) => {
                    warn!(code = code.code(), "Connection refused: {}", code.description());
                    shared.fail_connect(error);
                    break;
                }
            },
            Ok(TransportEvent::PubAck { .. }) => handler.on_publish_ack(),
            Ok(TransportEvent::Message { topic, payload }) => handler.on_message(&topic, &payload),
            Ok(TransportEvent::SubAck) => debug!("Subscription acknowledged"),
            Ok(TransportEvent::Other) => {}
            Ok(TransportEvent::Disconnected { clean }) => {
                shared.mark_disconnected(clean, "broker closed the session");
                break;
            }
            Err(e) => {
                if shared.current() == ConnectionState::Connecting {
                    warn!(error = %e, "Connection failed");
                    shared.fail_connect(ConnectionError::Refused(e.to_string()));
                } else {
                    shared.mark_disconnected(false, &e.to_string());
                }
                break;
            }
        }
    }
}
