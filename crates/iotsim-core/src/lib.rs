//! IoT sensor fleet simulation harness
//!
//! Simulates many sensor devices publishing telemetry over MQTT, and a few
//! subscribers counting what arrives, to load-test and demonstrate a broker.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `embedded-broker` | ❌ | In-process `rumqttd` broker |
//!
//! ## Architecture
//!
//! - **Statistics**: run-wide counters shared by every device task
//! - **SensorDataGenerator**: produces readings from an injected RNG and clock
//! - **ConnectionLifecycle**: per-device connect/disconnect state machine
//! - **DevicePublisher** / **DeviceSubscriber**: one task per simulated device
//! - **Simulation**: full, publishers-only and subscribers-only runs
//!
//! Devices talk to the broker through the [`transport::Transport`] trait,
//! implemented over `rumqttc` and by an in-process [`transport::MemoryBroker`].

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod probe;
pub mod publisher;
pub mod sensor;
pub mod simulation;
pub mod stats;
pub mod subscriber;
pub mod transport;

#[cfg(feature = "embedded-broker")]
pub mod embedded_broker;

pub use config::{RunMode, SimulationConfig};
pub use error::{ConnectionError, ParseError, PublishError, Result, SimulationError, TransportError};
pub use lifecycle::{ConnectionLifecycle, ConnectionState, DeviceRole, SessionHandler};
pub use publisher::{DevicePublisher, PublishOutcome, PublisherOptions};
pub use sensor::{
    Assignment, Clock, FixedClock, Location, SensorDataGenerator, SensorReading, SensorType,
    SystemClock,
};
pub use simulation::{Simulation, SimulationReport};
pub use stats::{StatKey, Statistics, StatisticsSnapshot};
pub use subscriber::{DeviceSubscriber, SubscriberHandle};
pub use transport::{MemoryBroker, MqttTransport, Transport};
