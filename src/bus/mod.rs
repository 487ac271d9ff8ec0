//! Broker publication for outbox records.
//!
//! This module contains:
//! - `Broker` trait: broker-acknowledged delivery of topic messages
//! - `TopicMessage`: broker-agnostic publish unit
//! - Implementations: Kafka, Noop, Mock
//! - `publisher`: background loop that drains the outbox

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::storage::OutboxRecord;

// Implementation modules
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod mock;
pub mod publisher;

// Re-exports
#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use mock::MockBroker;
pub use publisher::{spawn_publisher, OutboxPublisher, PublisherHandle};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Publish timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Message rejected: {0}")]
    Rejected(String),
}

impl BusError {
    /// Whether a later attempt could succeed. Rejected messages are
    /// malformed for the broker and will never go through; everything
    /// else is assumed transient.
    pub fn retryable(&self) -> bool {
        !matches!(self, BusError::Rejected(_))
    }
}

/// A keyed message bound for a broker topic.
///
/// The key is the broker partition key, so all messages sharing a key
/// keep their relative order on the topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub correlation_id: String,
}

impl From<&OutboxRecord> for TopicMessage {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            topic: record.topic.clone(),
            key: record.key.clone(),
            payload: record.payload.clone(),
            correlation_id: record.correlation_id.clone(),
        }
    }
}

/// Interface for broker publication.
///
/// Returning `Ok` means the broker acknowledged the message. The outbox
/// publisher treats anything else as not delivered, so implementations
/// must not buffer without acknowledgment.
///
/// Implementations:
/// - `KafkaBroker`: Kafka via rdkafka
/// - `NoopBroker`: acknowledges and drops (development)
/// - `MockBroker`: in-memory mock for testing
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish one message and wait for broker acknowledgment.
    async fn publish(&self, message: &TopicMessage) -> Result<()>;
}

// ============================================================================
// Noop broker
// ============================================================================

/// Broker that acknowledges everything without sending it anywhere.
///
/// Useful when running the log + stream side without a broker attached;
/// outbox records drain to `published` and the payloads are dropped.
#[derive(Debug, Default)]
pub struct NoopBroker;

#[async_trait]
impl Broker for NoopBroker {
    async fn publish(&self, message: &TopicMessage) -> Result<()> {
        debug!(
            topic = %message.topic,
            key = %message.key,
            "Dropped message (noop broker)"
        );
        Ok(())
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a broker based on configuration.
///
/// Returns the implementation matching `broker.type`. Kafka requires
/// building with `--features kafka`.
pub async fn init_broker(
    config: &BrokerConfig,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.broker_type.as_str() {
        "noop" => {
            info!(broker_type = "noop", "Broker initialized");
            Ok(Arc::new(NoopBroker))
        }
        "kafka" => {
            #[cfg(feature = "kafka")]
            {
                let broker = KafkaBroker::new(config)?;
                info!(broker_type = "kafka", brokers = %config.brokers, "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err("Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                    .into())
            }
        }
        other => Err(format!("Unknown broker type '{}'", other).into()),
    }
}
