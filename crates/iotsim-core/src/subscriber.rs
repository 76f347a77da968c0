//! Simulated listening device.
//!
//! A subscriber subscribes to `<topic_base>/#` once connected and counts
//! every inbound reading per source device. It listens until its session
//! drops or the shutdown signal fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::topics;
use crate::error::ConnectionError;
use crate::lifecycle::{ConnectionLifecycle, DeviceRole, SessionHandler};
use crate::sensor::SensorReading;
use crate::stats::{StatKey, Statistics};
use crate::transport::{QoS, Transport, TransportClient};

/// How often the listen loop re-checks its exit conditions without a wakeup.
const CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Log a progress line every this many parsed messages.
const PROGRESS_EVERY: u64 = 100;

struct Inbox {
    topic_filter: String,
    stats: Arc<Statistics>,
    summary: Mutex<HashMap<String, u64>>,
    received: AtomicU64,
    parsed: AtomicU64,
    parse_errors: AtomicU64,
}

#[async_trait]
impl SessionHandler for Inbox {
    /// A listener without a subscription would never hear anything, so a
    /// failed subscribe fails the connect. The device counts the error.
    async fn on_connected(&self, client: &dyn TransportClient) -> Result<(), ConnectionError> {
        client
            .subscribe(&self.topic_filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                error!(topic = %self.topic_filter, error = %e, "Subscribe failed");
                ConnectionError::Refused(format!("subscribe to {} failed: {}", self.topic_filter, e))
            })?;
        info!(topic = %self.topic_filter, "Subscribed");
        Ok(())
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        self.stats.increment(StatKey::TotalReceived);
        self.received.fetch_add(1, Ordering::SeqCst);

        match SensorReading::from_payload(payload) {
            Ok(reading) => {
                *self
                    .summary
                    .lock()
                    .entry(reading.device_id.clone())
                    .or_insert(0) += 1;

                let parsed = self.parsed.fetch_add(1, Ordering::SeqCst) + 1;
                if parsed % PROGRESS_EVERY == 0 {
                    info!(
                        received = parsed,
                        device_id = %reading.device_id,
                        sensor_type = %reading.sensor_type,
                        value = reading.value,
                        "Received {} messages",
                        parsed
                    );
                }
            }
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::SeqCst);
                self.stats.increment(StatKey::Errors);
                warn!(topic, error = %e, "Dropping unparseable message");
            }
        }
    }
}

/// Read access to a subscriber's counters, usable after `run` consumed it.
#[derive(Clone)]
pub struct SubscriberHandle {
    inbox: Arc<Inbox>,
}

impl SubscriberHandle {
    /// Copy of the per-device receive counts.
    pub fn get_summary(&self) -> HashMap<String, u64> {
        self.inbox.summary.lock().clone()
    }

    /// Messages delivered to this subscriber, parseable or not.
    pub fn received_count(&self) -> u64 {
        self.inbox.received.load(Ordering::SeqCst)
    }

    /// Messages this subscriber dropped because they did not parse.
    pub fn parse_error_count(&self) -> u64 {
        self.inbox.parse_errors.load(Ordering::SeqCst)
    }
}

/// One long-lived listener.
pub struct DeviceSubscriber {
    subscriber_id: String,
    connect_timeout: Duration,
    stats: Arc<Statistics>,
    inbox: Arc<Inbox>,
    lifecycle: ConnectionLifecycle,
}

impl DeviceSubscriber {
    pub fn new(
        subscriber_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        topic_base: &str,
        connect_timeout: Duration,
        stats: Arc<Statistics>,
    ) -> Self {
        let subscriber_id = subscriber_id.into();
        let inbox = Arc::new(Inbox {
            topic_filter: topics::wildcard(topic_base),
            stats: stats.clone(),
            summary: Mutex::new(HashMap::new()),
            received: AtomicU64::new(0),
            parsed: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        });

        let lifecycle = ConnectionLifecycle::new(
            format!("subscriber_{}", subscriber_id),
            DeviceRole::Subscriber,
            transport,
            stats.clone(),
            inbox.clone(),
        );

        Self {
            subscriber_id,
            connect_timeout,
            stats,
            inbox,
            lifecycle,
        }
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn handle(&self) -> SubscriberHandle {
        SubscriberHandle {
            inbox: self.inbox.clone(),
        }
    }

    pub fn get_summary(&self) -> HashMap<String, u64> {
        self.handle().get_summary()
    }

    pub fn received_count(&self) -> u64 {
        self.handle().received_count()
    }

    pub fn parse_error_count(&self) -> u64 {
        self.handle().parse_error_count()
    }

    /// Connect and listen until the session drops or `shutdown` becomes true
    /// (or its sender goes away). Always disconnects before returning.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
        let span = info_span!("subscriber", id = %self.subscriber_id);
        async move {
            self.listen(shutdown).await;
            self.lifecycle.disconnect().await;
            info!(
                received = self.received_count(),
                parse_errors = self.parse_error_count(),
                "Subscriber stopped"
            );
        }
        .instrument(span)
        .await
    }

    async fn listen(&mut self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.lifecycle.connect(self.connect_timeout).await {
            error!(error = %e, "Failed to connect");
            self.stats.increment(StatKey::Errors);
            return;
        }
        info!(topic = %self.inbox.topic_filter, "Listening");

        let mut state = self.lifecycle.subscribe_state();
        let mut check = tokio::time::interval(CHECK_INTERVAL);

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested");
                return;
            }
            if !self.lifecycle.is_connected() {
                warn!("Connection lost, stopping listener");
                return;
            }

            tokio::select! {
                _ = check.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown signal dropped");
                        return;
                    }
                }
                _ = state.changed() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PublishError, TransportError};
    use crate::transport::{
        ConnectBehavior, ConnectReturn, MemoryBroker, SessionOptions, TransportEventLoop,
    };

    fn subscriber(broker: &MemoryBroker, stats: &Arc<Statistics>) -> DeviceSubscriber {
        DeviceSubscriber::new(
            "0",
            Arc::new(broker.clone()),
            "iot/environment",
            Duration::from_millis(500),
            stats.clone(),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn reading(id: &str, seq: u64) -> String {
        format!(
            r#"{{"id": "{}", "location": "park_north", "sensor_type": "humidity",
                "packet_no": {}, "value": 50.0, "timestamp": "2024-05-01T12:00:00.000000"}}"#,
            id, seq
        )
    }

    #[tokio::test]
    async fn test_counts_per_device_and_drops_garbage() {
        let broker = MemoryBroker::new();
        let stats = Arc::new(Statistics::new());
        let sub = subscriber(&broker, &stats);
        let handle = sub.handle();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sub.run(stop_rx));

        wait_until(|| stats.get(StatKey::ActiveSubscribers) == 1).await;

        let topic = "iot/environment/park_north/humidity";
        broker.publish_raw(topic, reading("1", 1));
        broker.publish_raw(topic, reading("1", 2));
        broker.publish_raw(topic, reading("2", 1));
        broker.publish_raw(topic, "not json");
        broker.publish_raw(topic, r#"{"id": "1"}"#);
        broker.publish_raw("other/topic", reading("9", 1));

        wait_until(|| handle.received_count() == 5).await;

        let summary = handle.get_summary();
        assert_eq!(summary.get("1"), Some(&2));
        assert_eq!(summary.get("2"), Some(&1));
        assert_eq!(summary.get("9"), None);
        assert_eq!(handle.parse_error_count(), 2);
        assert_eq!(
            summary.values().sum::<u64>(),
            handle.received_count() - handle.parse_error_count()
        );

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_received, 5);
        assert_eq!(snapshot.errors, 2);
        assert_eq!(snapshot.active_subscribers, 0);
    }

    #[tokio::test]
    async fn test_returns_when_session_drops() {
        let broker = MemoryBroker::new();
        let stats = Arc::new(Statistics::new());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(subscriber(&broker, &stats).run(stop_rx));

        wait_until(|| stats.get(StatKey::ActiveSubscribers) == 1).await;
        assert!(broker.disconnect_client("subscriber_0"));

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.get(StatKey::Errors), 1);
        assert_eq!(stats.get(StatKey::ActiveSubscribers), 0);
    }

    #[tokio::test]
    async fn test_refused_connect_counts_one_error() {
        let broker = MemoryBroker::with_behavior(ConnectBehavior::Refuse(ConnectReturn::BadCredentials));
        let stats = Arc::new(Statistics::new());
        let (_stop_tx, stop_rx) = watch::channel(false);

        subscriber(&broker, &stats).run(stop_rx).await;

        assert_eq!(stats.get(StatKey::Errors), 1);
        assert_eq!(stats.get(StatKey::ActiveSubscribers), 0);
    }

    /// Broker that accepts connections but rejects every subscription.
    struct NoSubscriptions(MemoryBroker);

    struct NoSubscriptionsClient(Arc<dyn TransportClient>);

    #[async_trait]
    impl TransportClient for NoSubscriptionsClient {
        async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
            self.0.publish(topic, payload, qos).await
        }

        async fn subscribe(&self, _topic_filter: &str, _qos: QoS) -> Result<(), TransportError> {
            Err(TransportError::Rejected("subscriptions disabled".to_string()))
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.0.disconnect().await
        }
    }

    impl Transport for NoSubscriptions {
        fn open(
            &self,
            options: &SessionOptions,
        ) -> (Arc<dyn TransportClient>, Box<dyn TransportEventLoop>) {
            let (client, events) = self.0.open(options);
            (Arc::new(NoSubscriptionsClient(client)), events)
        }

        fn describe(&self) -> String {
            "no-subscriptions".to_string()
        }
    }

    #[tokio::test]
    async fn test_failed_subscribe_ends_listener() {
        let broker = MemoryBroker::new();
        let stats = Arc::new(Statistics::new());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let sub = DeviceSubscriber::new(
            "0",
            Arc::new(NoSubscriptions(broker.clone())),
            "iot/environment",
            Duration::from_millis(500),
            stats.clone(),
        );
        tokio::time::timeout(Duration::from_secs(2), sub.run(stop_rx))
            .await
            .unwrap();

        assert_eq!(stats.get(StatKey::Errors), 1);
        assert_eq!(stats.get(StatKey::ActiveSubscribers), 0);
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_stops_when_signal_sender_dropped() {
        let broker = MemoryBroker::new();
        let stats = Arc::new(Statistics::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(subscriber(&broker, &stats).run(stop_rx));

        wait_until(|| stats.get(StatKey::ActiveSubscribers) == 1).await;
        drop(stop_tx);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.get(StatKey::Errors), 0);
    }
}
