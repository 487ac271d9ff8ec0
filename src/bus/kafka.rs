//! Kafka broker implementation.
//!
//! Message key: the outbox record key, so a session's messages land on
//! one partition in order. The correlation id travels as a
//! `correlationId` header next to the JSON payload.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{debug, info};

use super::{Broker, BusError, Result, TopicMessage};
use crate::config::BrokerConfig;

/// Kafka broker publishing through an idempotent producer.
pub struct KafkaBroker {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaBroker {
    /// Create a producer from broker configuration.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let mut client = ClientConfig::new();
        client.set("bootstrap.servers", &config.brokers);
        client.set("message.timeout.ms", "5000");
        client.set("acks", "all");
        client.set("enable.idempotence", "true");

        if let Some(ref sasl) = config.sasl {
            client.set("security.protocol", "SASL_SSL");
            client.set("sasl.mechanism", &sasl.mechanism);
            client.set("sasl.username", &sasl.username);
            client.set("sasl.password", &sasl.password);
        }

        let producer: FutureProducer = client
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        info!(brokers = %config.brokers, "Connected to Kafka");

        Ok(Self {
            producer,
            send_timeout: Duration::from_secs(5),
        })
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %message.topic, key = %message.key))]
    async fn publish(&self, message: &TopicMessage) -> Result<()> {
        let payload = serde_json::to_vec(&message.payload)
            .map_err(|e| BusError::Rejected(format!("Unserializable payload: {}", e)))?;

        let headers = OwnedHeaders::new().insert(Header {
            key: "correlationId",
            value: Some(message.correlation_id.as_str()),
        });

        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&payload)
            .headers(headers);

        self.producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| BusError::Publish(format!("Failed to publish: {}", e)))?;

        debug!(
            topic = %message.topic,
            key = %message.key,
            "Published message to Kafka"
        );

        Ok(())
    }
}
