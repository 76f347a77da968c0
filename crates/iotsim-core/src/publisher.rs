//! Simulated publishing device.
//!
//! A publisher connects, publishes a bounded number of readings to
//! `<topic_base>/<location>/<sensor_type>` at QoS 1 with a jittered delay
//! between them, and disconnects on every exit path.
//!
//! `total_published` is incremented when the broker acknowledges a publish,
//! never on local acceptance. A publish whose local call fails counts as an
//! error and can never be counted as published, except a publish on a
//! session the broker already dropped: that drop is counted once, by the
//! lifecycle.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{defaults, topics, SimulationConfig};
use crate::error::PublishError;
use crate::lifecycle::{ConnectionLifecycle, DeviceRole, SessionHandler};
use crate::sensor::{Assignment, Clock, SensorDataGenerator};
use crate::stats::{StatKey, Statistics};
use crate::transport::{QoS, Transport};

/// Per-device publishing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherOptions {
    pub message_count: u64,
    pub interval: Duration,
    /// Fraction of `interval` the delay may vary by in either direction.
    pub jitter: f64,
    pub connect_timeout: Duration,
    pub topic_base: String,
    /// Seed for this device's random source. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            message_count: defaults::MESSAGES_PER_DEVICE,
            interval: Duration::from_millis(defaults::INTERVAL_MS),
            jitter: defaults::JITTER,
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            topic_base: defaults::TOPIC_BASE.to_string(),
            seed: None,
        }
    }
}

impl PublisherOptions {
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            message_count: config.messages_per_device,
            interval: config.interval(),
            jitter: config.jitter,
            connect_timeout: config.connect_timeout(),
            topic_base: config.topic_base.clone(),
            seed: config.seed,
        }
    }
}

/// What one publisher run did, as seen from the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// The session reached `Connected`.
    pub connected: bool,
    /// Publishes tried on a live session, successful or not.
    pub attempted: u64,
    /// Publishes accepted locally by the transport.
    pub accepted: u64,
}

struct AckCounter {
    stats: Arc<Statistics>,
}

impl SessionHandler for AckCounter {
    fn on_publish_ack(&self) {
        self.stats.increment(StatKey::TotalPublished);
    }
}

/// One simulated sensor device.
pub struct DevicePublisher {
    device_id: String,
    assignment: Assignment,
    options: PublisherOptions,
    stats: Arc<Statistics>,
    generator: SensorDataGenerator,
    rng: StdRng,
    lifecycle: ConnectionLifecycle,
}

impl DevicePublisher {
    /// Create a publisher. Without an `assignment`, location and sensor type
    /// are picked at random here, once.
    pub fn new(
        device_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        options: PublisherOptions,
        stats: Arc<Statistics>,
        assignment: Option<Assignment>,
    ) -> Self {
        let device_id = device_id.into();
        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let assignment = assignment.unwrap_or_else(|| Assignment::random(&mut rng));

        let lifecycle = ConnectionLifecycle::new(
            format!("publisher_{}", device_id),
            DeviceRole::Publisher,
            transport,
            stats.clone(),
            Arc::new(AckCounter {
                stats: stats.clone(),
            }),
        );

        Self {
            device_id,
            assignment,
            options,
            stats,
            generator: SensorDataGenerator::default(),
            rng,
            lifecycle,
        }
    }

    /// Use `clock` for reading timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.generator = SensorDataGenerator::new(clock);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn assignment(&self) -> Assignment {
        self.assignment
    }

    pub fn topic(&self) -> String {
        topics::device_topic(
            &self.options.topic_base,
            self.assignment.location.as_str(),
            self.assignment.sensor_type.as_str(),
        )
    }

    /// Connect, publish `message_count` readings, disconnect.
    pub async fn run(mut self) -> PublishOutcome {
        let span = info_span!("publisher", device_id = %self.device_id);
        async move {
            let outcome = self.publish_all().await;
            self.lifecycle.disconnect().await;
            info!(
                attempted = outcome.attempted,
                accepted = outcome.accepted,
                "Publisher finished"
            );
            outcome
        }
        .instrument(span)
        .await
    }

    async fn publish_all(&mut self) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();
        info!(
            location = %self.assignment.location,
            sensor_type = %self.assignment.sensor_type,
            "Starting publisher"
        );

        if let Err(e) = self.lifecycle.connect(self.options.connect_timeout).await {
            error!(error = %e, "Failed to connect");
            self.stats.increment(StatKey::Errors);
            return outcome;
        }
        outcome.connected = true;

        let topic = self.topic();
        for sequence_no in 1..=self.options.message_count {
            if !self.lifecycle.is_connected() {
                warn!(
                    sent = outcome.attempted,
                    "Connection lost, stopping publish loop"
                );
                break;
            }

            let reading = self.generator.next(
                &mut self.rng,
                &self.device_id,
                self.assignment.location,
                self.assignment.sensor_type,
                sequence_no,
            );

            let published = match reading.to_payload() {
                Ok(payload) => self.lifecycle.publish(&topic, payload, QoS::AtLeastOnce).await,
                Err(e) => Err(PublishError::TransportRejected(e.to_string())),
            };
            match published {
                Ok(()) => {
                    outcome.attempted += 1;
                    outcome.accepted += 1;
                    debug!(sequence_no, value = reading.value, topic = %topic, "Published");
                }
                Err(PublishError::SessionClosed) => {
                    self.session_lost(outcome.attempted).await;
                    break;
                }
                Err(e) => {
                    outcome.attempted += 1;
                    error!(sequence_no, error = %e, "Publish failed");
                    self.stats.increment(StatKey::Errors);
                }
            }

            tokio::time::sleep(self.jittered_interval()).await;
        }

        outcome
    }

    /// The session closed under a publish before the lifecycle saw the drop.
    /// The lifecycle counts the drop once it catches up; only a session that
    /// never reports it is counted here.
    async fn session_lost(&self, sent: u64) {
        warn!(sent, "Connection lost, stopping publish loop");
        if !self
            .lifecycle
            .wait_until_disconnected(self.options.connect_timeout)
            .await
        {
            error!("Session closed without a disconnect notification");
            self.stats.increment(StatKey::Errors);
        }
    }

    /// `interval * (1 ± jitter)`, drawn fresh on each call.
    fn jittered_interval(&mut self) -> Duration {
        let jitter = self.options.jitter;
        let factor = 1.0 + self.rng.gen_range(-jitter..=jitter);
        self.options.interval.mul_f64(factor.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::error::TransportError;
    use crate::lifecycle::ConnectionState;
    use crate::sensor::{Location, SensorReading, SensorType};
    use crate::transport::{
        ConnectBehavior, MemoryBroker, SessionOptions, TransportClient, TransportEvent,
        TransportEventLoop,
    };

    fn fast_options(message_count: u64) -> PublisherOptions {
        PublisherOptions {
            message_count,
            interval: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(500),
            seed: Some(11),
            ..PublisherOptions::default()
        }
    }

    #[tokio::test]
    async fn test_publishes_every_message_and_counts_acks() {
        let broker = MemoryBroker::new();
        let stats = Arc::new(Statistics::new());
        let publisher = DevicePublisher::new(
            "1",
            Arc::new(broker.clone()),
            fast_options(10),
            stats.clone(),
            Some(Assignment::new(Location::CityCenter, SensorType::Temperature)),
        );
        assert_eq!(publisher.topic(), "iot/environment/city_center/temperature");

        let outcome = publisher.run().await;
        assert_eq!(
            outcome,
            PublishOutcome {
                connected: true,
                attempted: 10,
                accepted: 10
            }
        );

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_published, 10);
        assert_eq!(snapshot.errors, 0);
        assert_eq!(snapshot.active_publishers, 0);
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_sequence_numbers_start_at_one() {
        let broker = MemoryBroker::new();
        let (listener, mut events) = broker.open(&SessionOptions::new("listener"));
        events.poll().await.unwrap();
        listener
            .subscribe("iot/environment/#", QoS::AtLeastOnce)
            .await
            .unwrap();
        events.poll().await.unwrap();

        let stats = Arc::new(Statistics::new());
        DevicePublisher::new("7", Arc::new(broker.clone()), fast_options(5), stats, None)
            .run()
            .await;

        let mut seen = Vec::new();
        while seen.len() < 5 {
            if let TransportEvent::Message { payload, .. } = events.poll().await.unwrap() {
                let reading = SensorReading::from_payload(&payload).unwrap();
                assert_eq!(reading.device_id, "7");
                seen.push(reading.sequence_no);
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_connect_timeout_skips_publishing() {
        let broker = MemoryBroker::with_behavior(ConnectBehavior::Silent);
        let stats = Arc::new(Statistics::new());
        let mut options = fast_options(10);
        options.connect_timeout = Duration::from_millis(30);

        let outcome = DevicePublisher::new("1", Arc::new(broker), options, stats.clone(), None)
            .run()
            .await;

        assert_eq!(outcome, PublishOutcome::default());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.total_published, 0);
        assert_eq!(snapshot.active_publishers, 0);
    }

    #[tokio::test]
    async fn test_forced_disconnect_breaks_loop() {
        let broker = MemoryBroker::new();
        let stats = Arc::new(Statistics::new());
        let mut options = fast_options(200);
        options.interval = Duration::from_millis(10);
        options.jitter = 0.0;

        let publisher = DevicePublisher::new("3", Arc::new(broker.clone()), options, stats.clone(), None);
        let mut state = publisher.lifecycle.subscribe_state();
        let handle = tokio::spawn(publisher.run());

        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while stats.get(StatKey::TotalPublished) < 3 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert!(broker.disconnect_client("publisher_3"));

        let outcome = handle.await.unwrap();
        assert!(outcome.connected);
        assert!(outcome.attempted < 200);
        assert_eq!(outcome.attempted, outcome.accepted);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.total_published, outcome.accepted);
        assert_eq!(snapshot.active_publishers, 0);
    }

    /// Drops the session from the broker side right before the publish
    /// numbered `drop_at`, so that publish lands on a closed session before
    /// the event loop has seen the drop.
    struct DropMidPublish {
        broker: MemoryBroker,
        drop_at: usize,
    }

    struct DropMidPublishClient {
        inner: Arc<dyn TransportClient>,
        broker: MemoryBroker,
        client_id: String,
        drop_at: usize,
        published: AtomicUsize,
    }

    #[async_trait]
    impl TransportClient for DropMidPublishClient {
        async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
            if self.published.fetch_add(1, Ordering::SeqCst) == self.drop_at {
                self.broker.disconnect_client(&self.client_id);
            }
            self.inner.publish(topic, payload, qos).await
        }

        async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError> {
            self.inner.subscribe(topic_filter, qos).await
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.inner.disconnect().await
        }
    }

    impl Transport for DropMidPublish {
        fn open(
            &self,
            options: &SessionOptions,
        ) -> (Arc<dyn TransportClient>, Box<dyn TransportEventLoop>) {
            let (inner, events) = self.broker.open(options);
            let client = DropMidPublishClient {
                inner,
                broker: self.broker.clone(),
                client_id: options.client_id.clone(),
                drop_at: self.drop_at,
                published: AtomicUsize::new(0),
            };
            (Arc::new(client), events)
        }

        fn describe(&self) -> String {
            "drop-mid-publish".to_string()
        }
    }

    #[tokio::test]
    async fn test_publish_on_dropped_session_counts_one_error() {
        let broker = MemoryBroker::new();
        let stats = Arc::new(Statistics::new());
        let transport = DropMidPublish {
            broker: broker.clone(),
            drop_at: 4,
        };

        let outcome = DevicePublisher::new("5", Arc::new(transport), fast_options(10), stats.clone(), None)
            .run()
            .await;

        assert_eq!(
            outcome,
            PublishOutcome {
                connected: true,
                attempted: 4,
                accepted: 4
            }
        );
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.total_published, 4);
        assert_eq!(snapshot.active_publishers, 0);
        assert_eq!(broker.session_count(), 0);
    }

    #[test]
    fn test_jittered_interval_bounds() {
        let mut options = fast_options(1);
        options.interval = Duration::from_millis(1000);
        options.jitter = 0.1;
        let mut publisher = DevicePublisher::new(
            "1",
            Arc::new(MemoryBroker::new()),
            options,
            Arc::new(Statistics::new()),
            None,
        );

        for _ in 0..200 {
            let delay = publisher.jittered_interval();
            assert!(delay >= Duration::from_millis(900) && delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_seeded_assignment_is_stable() {
        let make = || {
            DevicePublisher::new(
                "1",
                Arc::new(MemoryBroker::new()),
                fast_options(1),
                Arc::new(Statistics::new()),
                None,
            )
            .assignment()
        };
        assert_eq!(make(), make());
    }
}
