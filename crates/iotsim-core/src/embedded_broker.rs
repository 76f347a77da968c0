//! In-process MQTT broker (`embedded-broker` feature).
//!
//! Starts a `rumqttd` MQTT 3.1.1 listener on a dedicated thread so a
//! simulation can run against a real MQTT stack without installing a broker.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

/// How long `start` waits for the listener to accept connections.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum EmbeddedBrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid listen address: {0}")]
    Address(String),

    #[error("Broker did not start listening on {0}")]
    NotListening(SocketAddr),
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedBrokerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on concurrent client sessions. Must cover every simulated device.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    crate::config::defaults::PORT
}

fn default_max_connections() -> usize {
    1000
}

impl Default for EmbeddedBrokerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

impl EmbeddedBrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Raise the connection limit to at least `devices` plus headroom.
    pub fn with_capacity_for(mut self, devices: usize) -> Self {
        self.max_connections = self.max_connections.max(devices + 16);
        self
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, EmbeddedBrokerError> {
        format!("{}:{}", self.listen, self.port)
            .parse()
            .map_err(|e| EmbeddedBrokerError::Address(format!("{}:{}: {}", self.listen, self.port, e)))
    }

    fn broker_config(&self, addr: SocketAddr) -> rumqttd::Config {
        let mut servers = HashMap::new();
        servers.insert(
            "iotsim".to_string(),
            rumqttd::ServerSettings {
                name: "iotsim-broker".to_string(),
                listen: addr,
                tls: None,
                next_connection_delay_ms: 1,
                connections: rumqttd::ConnectionSettings {
                    connection_timeout_ms: 60_000,
                    max_payload_size: 1024 * 1024,
                    max_inflight_count: 200,
                    auth: None,
                    external_auth: None,
                    dynamic_filters: true,
                },
            },
        );

        rumqttd::Config {
            id: 0,
            router: rumqttd::RouterConfig {
                max_connections: self.max_connections,
                max_outgoing_packet_count: 200,
                max_segment_size: 1024 * 1024,
                max_segment_count: 10,
                custom_segment: None,
                initialized_filters: None,
                ..Default::default()
            },
            v4: Some(servers),
            v5: None,
            ws: None,
            cluster: None,
            console: None,
            bridge: None,
            prometheus: None,
            metrics: None,
        }
    }
}

/// A running embedded broker. The broker thread lives until the process exits.
#[derive(Debug)]
pub struct EmbeddedBroker {
    addr: SocketAddr,
}

impl EmbeddedBroker {
    /// Spawn the broker and wait until its listener accepts connections.
    pub fn start(config: &EmbeddedBrokerConfig) -> Result<Self, EmbeddedBrokerError> {
        let addr = config.socket_addr()?;
        let broker_config = config.broker_config(addr);

        thread::Builder::new()
            .name("iotsim-broker".to_string())
            .spawn(move || {
                info!(%addr, "Starting embedded MQTT broker");
                let mut broker = rumqttd::Broker::new(broker_config);
                match broker.start() {
                    Ok(()) => info!("Embedded MQTT broker stopped"),
                    Err(e) => error!(error = %e, "Embedded MQTT broker failed"),
                }
            })?;

        let deadline = Instant::now() + STARTUP_TIMEOUT;
        while Instant::now() < deadline {
            if TcpStream::connect_timeout(&probe_addr(addr), Duration::from_millis(100)).is_ok() {
                info!(%addr, "Embedded MQTT broker ready");
                return Ok(Self { addr });
            }
            thread::sleep(Duration::from_millis(50));
        }
        Err(EmbeddedBrokerError::NotListening(addr))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Unspecified listen addresses are probed on loopback.
fn probe_addr(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    } else {
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_builders() {
        let config = EmbeddedBrokerConfig::new()
            .with_listen("0.0.0.0")
            .with_port(18830)
            .with_capacity_for(2000);

        assert_eq!(config.port, 18830);
        assert_eq!(config.max_connections, 2016);
        assert_eq!(config.socket_addr().unwrap().port(), 18830);
        assert_eq!(
            probe_addr(config.socket_addr().unwrap()),
            "127.0.0.1:18830".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_invalid_listen_address() {
        let config = EmbeddedBrokerConfig::new().with_listen("not an ip");
        assert!(matches!(
            config.socket_addr(),
            Err(EmbeddedBrokerError::Address(_))
        ));
    }
}
