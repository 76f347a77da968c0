//! Error types for the simulation harness.
//!
//! Device-level errors (`ConnectionError`, `PublishError`, `ParseError`) never
//! leave the device task that produced them: they are logged and turned into
//! an `errors` counter increment. Only `SimulationError` reaches the caller.

use std::time::Duration;

use thiserror::Error;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, SimulationError>;

/// Failure to bring a session to the `Connected` state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Broker or network refused the connection.
    #[error("Connection refused: {0}")]
    Refused(String),

    /// No connect result arrived in time.
    #[error("Connection timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Broker rejected the credentials or the client is not authorized.
    #[error("Connection unauthorized: {0}")]
    Unauthorized(String),

    /// Broker does not speak the requested protocol version.
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),
}

/// Failure to hand a message to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The transport did not accept the publish request locally.
    #[error("Transport rejected publish: {0}")]
    TransportRejected(String),

    /// The session is already gone. The disconnect path owns the error count.
    #[error("Session closed")]
    SessionClosed,
}

/// Failure to decode an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The payload is not a sensor reading.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        ParseError::MalformedPayload(e.to_string())
    }
}

/// Errors raised by the transport seam itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Network I/O failure.
    #[error("Transport I/O error: {0}")]
    Io(String),

    /// The session was closed and cannot be used any more.
    #[error("Session closed")]
    Closed,

    /// Request could not be queued.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Orchestrator-level errors. These fail fast before any device task starts.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while loading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = ConnectionError::Timeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "Connection timeout after 10000ms");
    }

    #[test]
    fn test_parse_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ParseError = json_err.into();
        assert!(err.to_string().starts_with("Malformed payload"));
    }

    #[test]
    fn test_session_closed_message() {
        assert_eq!(PublishError::SessionClosed.to_string(), "Session closed");
    }
}
