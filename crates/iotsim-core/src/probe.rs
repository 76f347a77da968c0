//! Broker reachability check.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use uuid::Uuid;

use crate::error::ConnectionError;
use crate::lifecycle::{ConnectionLifecycle, DeviceRole, NoopHandler};
use crate::stats::Statistics;
use crate::transport::Transport;

/// Open one session, wait up to `timeout` for the broker to accept it, then
/// disconnect.
pub async fn check_broker(
    transport: Arc<dyn Transport>,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    let target = transport.describe();
    let client_id = format!("iotsim_probe_{}", Uuid::new_v4().simple());
    info!(%target, "Attempting to connect to broker at {}...", target);

    let mut lifecycle = ConnectionLifecycle::new(
        client_id,
        DeviceRole::Probe,
        transport,
        Arc::new(Statistics::new()),
        Arc::new(NoopHandler),
    );

    let result = lifecycle.connect(timeout).await;
    lifecycle.disconnect().await;

    match &result {
        Ok(()) => {
            info!("Successfully connected to MQTT broker.");
            info!("Broker is running normally.");
        }
        Err(e) => {
            error!(%target, error = %e, "Broker check failed");
            for hint in hints(e) {
                error!("  - {}", hint);
            }
        }
    }
    result
}

/// Troubleshooting suggestions for a failed connection.
pub fn hints(error: &ConnectionError) -> &'static [&'static str] {
    match error {
        ConnectionError::Timeout(_) => &[
            "Check if the broker is running.",
            "Verify the address and port.",
            "Check firewall settings.",
        ],
        ConnectionError::Refused(_) => &[
            "Ensure the broker is running and accessible.",
            "Verify the address and port.",
        ],
        ConnectionError::Unauthorized(_) => &[
            "The broker requires credentials or denies this client.",
            "Check the broker's authentication and ACL settings.",
        ],
        ConnectionError::ProtocolMismatch(_) => {
            &["The broker does not accept MQTT 3.1.1 clients."]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectBehavior, ConnectReturn, MemoryBroker};

    #[tokio::test]
    async fn test_reachable_broker() {
        let broker = MemoryBroker::new();
        check_broker(Arc::new(broker.clone()), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_and_silent_brokers() {
        let refusing =
            MemoryBroker::with_behavior(ConnectBehavior::Refuse(ConnectReturn::BadCredentials));
        let err = check_broker(Arc::new(refusing), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Unauthorized(_)));
        assert!(!hints(&err).is_empty());

        let silent = MemoryBroker::with_behavior(ConnectBehavior::Silent);
        let err = check_broker(Arc::new(silent), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(_)));
    }
}
