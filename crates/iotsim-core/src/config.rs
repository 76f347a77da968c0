//! Simulation configuration.
//!
//! Defaults live in [`defaults`], environment variable names in [`env_vars`].
//! A [`SimulationConfig`] can be built in code with the `with_*` setters or
//! loaded from a TOML file; fields missing from the file fall back to the
//! environment and then to the built-in defaults.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};
use crate::sensor::Assignment;

/// Built-in defaults.
pub mod defaults {
    pub const BROKER: &str = "localhost";
    pub const PORT: u16 = 1883;
    pub const TOPIC_BASE: &str = "iot/environment";

    pub const NUM_PUBLISHERS: usize = 100;
    pub const NUM_SUBSCRIBERS: usize = 3;
    pub const MESSAGES_PER_DEVICE: u64 = 10;

    /// Base delay between two publishes of one device.
    pub const INTERVAL_MS: u64 = 5_000;
    /// Publish delay varies by up to this fraction either way.
    pub const JITTER: f64 = 0.1;

    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
    /// Wait after subscribers start, before publishers start.
    pub const SETTLE_DELAY_MS: u64 = 2_000;
    /// Wait after publishers finish, for in-flight messages.
    pub const DRAIN_DELAY_MS: u64 = 10_000;
    pub const STATS_INTERVAL_MS: u64 = 10_000;
    /// Delay between two publisher launches.
    pub const LAUNCH_STAGGER_MS: u64 = 50;

    pub const KEEP_ALIVE_SECS: u64 = 60;
    pub const PROBE_TIMEOUT_MS: u64 = 3_000;
}

/// Environment variable names.
pub mod env_vars {
    pub const BROKER: &str = "IOTSIM_BROKER";
    pub const PORT: &str = "IOTSIM_PORT";
    pub const LOG_JSON: &str = "IOTSIM_LOG_JSON";

    /// Broker host from the environment, or the default.
    pub fn broker() -> String {
        std::env::var(BROKER)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| super::defaults::BROKER.to_string())
    }

    /// Broker port from the environment, or the default.
    pub fn port() -> u16 {
        parse_port(std::env::var(PORT).ok().as_deref())
    }

    pub(crate) fn parse_port(raw: Option<&str>) -> u16 {
        raw.and_then(|s| s.trim().parse().ok())
            .unwrap_or(super::defaults::PORT)
    }
}

/// Topic layout.
pub mod topics {
    /// `<topic_base>/<location>/<sensor_type>`
    pub fn device_topic(topic_base: &str, location: &str, sensor_type: &str) -> String {
        format!("{}/{}/{}", topic_base, location, sensor_type)
    }

    /// `<topic_base>/#`
    pub fn wildcard(topic_base: &str) -> String {
        format!("{}/#", topic_base)
    }
}

/// Which device populations a run launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunMode {
    /// Subscribers, then publishers, then drain.
    #[default]
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "pub-only")]
    PublishersOnly,
    #[serde(rename = "sub-only")]
    SubscribersOnly,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::PublishersOnly => "pub-only",
            RunMode::SubscribersOnly => "sub-only",
        }
    }

    pub fn has_publishers(&self) -> bool {
        matches!(self, RunMode::Full | RunMode::PublishersOnly)
    }

    pub fn has_subscribers(&self) -> bool {
        matches!(self, RunMode::Full | RunMode::SubscribersOnly)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(RunMode::Full),
            "pub-only" => Ok(RunMode::PublishersOnly),
            "sub-only" => Ok(RunMode::SubscribersOnly),
            other => Err(SimulationError::Config(format!(
                "invalid mode '{}', expected one of: full, pub-only, sub-only",
                other
            ))),
        }
    }
}

/// Parameters of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Broker host name or address.
    #[serde(default = "env_vars::broker")]
    pub broker: String,

    #[serde(default = "env_vars::port")]
    pub port: u16,

    #[serde(default = "default_topic_base")]
    pub topic_base: String,

    #[serde(default = "default_num_publishers")]
    pub num_publishers: usize,

    #[serde(default = "default_num_subscribers")]
    pub num_subscribers: usize,

    #[serde(default = "default_messages_per_device")]
    pub messages_per_device: u64,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_drain_delay_ms")]
    pub drain_delay_ms: u64,

    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,

    #[serde(default = "default_launch_stagger_ms")]
    pub launch_stagger_ms: u64,

    /// Explicit `(location, sensor_type)` pairs. `None` assigns randomly per device.
    #[serde(default)]
    pub assignments: Option<Vec<Assignment>>,

    /// Seed for all random choices of the run. `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_topic_base() -> String {
    defaults::TOPIC_BASE.to_string()
}

fn default_num_publishers() -> usize {
    defaults::NUM_PUBLISHERS
}

fn default_num_subscribers() -> usize {
    defaults::NUM_SUBSCRIBERS
}

fn default_messages_per_device() -> u64 {
    defaults::MESSAGES_PER_DEVICE
}

fn default_interval_ms() -> u64 {
    defaults::INTERVAL_MS
}

fn default_jitter() -> f64 {
    defaults::JITTER
}

fn default_connect_timeout_ms() -> u64 {
    defaults::CONNECT_TIMEOUT_MS
}

fn default_settle_delay_ms() -> u64 {
    defaults::SETTLE_DELAY_MS
}

fn default_drain_delay_ms() -> u64 {
    defaults::DRAIN_DELAY_MS
}

fn default_stats_interval_ms() -> u64 {
    defaults::STATS_INTERVAL_MS
}

fn default_launch_stagger_ms() -> u64 {
    defaults::LAUNCH_STAGGER_MS
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            broker: env_vars::broker(),
            port: env_vars::port(),
            topic_base: default_topic_base(),
            num_publishers: default_num_publishers(),
            num_subscribers: default_num_subscribers(),
            messages_per_device: default_messages_per_device(),
            interval_ms: default_interval_ms(),
            jitter: default_jitter(),
            connect_timeout_ms: default_connect_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            drain_delay_ms: default_drain_delay_ms(),
            stats_interval_ms: default_stats_interval_ms(),
            launch_stagger_ms: default_launch_stagger_ms(),
            assignments: None,
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_broker(mut self, broker: impl Into<String>, port: u16) -> Self {
        self.broker = broker.into();
        self.port = port;
        self
    }

    pub fn with_topic_base(mut self, topic_base: impl Into<String>) -> Self {
        self.topic_base = topic_base.into();
        self
    }

    pub fn with_publishers(mut self, n: usize) -> Self {
        self.num_publishers = n;
        self
    }

    pub fn with_subscribers(mut self, n: usize) -> Self {
        self.num_subscribers = n;
        self
    }

    pub fn with_messages_per_device(mut self, n: u64) -> Self {
        self.messages_per_device = n;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_launch_stagger(mut self, stagger: Duration) -> Self {
        self.launch_stagger_ms = stagger.as_millis() as u64;
        self
    }

    pub fn with_assignments(mut self, assignments: Vec<Assignment>) -> Self {
        self.assignments = Some(assignments);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn launch_stagger(&self) -> Duration {
        Duration::from_millis(self.launch_stagger_ms)
    }

    /// Check the configuration for `mode`. Called before any device task starts.
    pub fn validate(&self, mode: RunMode) -> Result<()> {
        if self.broker.trim().is_empty() {
            return Err(SimulationError::Config("broker must not be empty".into()));
        }
        if self.topic_base.trim().is_empty() {
            return Err(SimulationError::Config("topic_base must not be empty".into()));
        }
        if self.stats_interval_ms == 0 {
            return Err(SimulationError::Config(
                "stats_interval_ms must be at least 1".into(),
            ));
        }

        if mode.has_publishers() {
            if self.num_publishers == 0 {
                return Err(SimulationError::Config(format!(
                    "mode '{}' requires at least one publisher",
                    mode
                )));
            }
            if self.messages_per_device == 0 {
                return Err(SimulationError::Config(
                    "messages_per_device must be at least 1".into(),
                ));
            }
            if !self.jitter.is_finite() || !(0.0..1.0).contains(&self.jitter) {
                return Err(SimulationError::Config(format!(
                    "jitter must be in [0, 1), got {}",
                    self.jitter
                )));
            }
            if matches!(&self.assignments, Some(list) if list.is_empty()) {
                return Err(SimulationError::Config(
                    "assignments must not be empty when given".into(),
                ));
            }
        }

        if mode.has_subscribers() && self.num_subscribers == 0 {
            return Err(SimulationError::Config(format!(
                "mode '{}' requires at least one subscriber",
                mode
            )));
        }

        Ok(())
    }
}
