//! Kafka-backed event bus.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Deserialize;

use crate::{BusMessage, EventBus, EventBusError, Result};

/// Kafka connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    /// Topic events are published to.
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    /// Producer-side send timeout in milliseconds.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_topic() -> String {
    "saga.participant.events.v1".to_string()
}

fn default_security_protocol() -> String {
    "PLAINTEXT".to_string()
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

/// Event bus backed by a Kafka producer.
///
/// Messages are keyed by aggregate ID, which maps to Kafka partitioning
/// and preserves per-aggregate order. `acks=all` keeps the at-least-once
/// property: a publish only succeeds once the cluster has the message.
pub struct KafkaEventBus {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaEventBus {
    /// Creates a new Kafka event bus from the given configuration.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", config.brokers.join(","));
        client_config.set("security.protocol", &config.security_protocol);
        client_config.set("acks", "all");
        client_config.set("message.timeout.ms", config.send_timeout_ms.to_string());
        // Required for per-key ordering when a send is retried internally.
        client_config.set("enable.idempotence", "true");

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| EventBusError::PublishFailed(format!("producer init: {e}")))?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
        })
    }
}

#[async_trait]
impl EventBus for KafkaEventBus {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        let payload = serde_json::to_vec(&message.payload)?;
        let event_id = message.event_id.to_string();
        let created_at = message.created_at.to_rfc3339();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "event_id",
                value: Some(event_id.as_str()),
            })
            .insert(Header {
                key: "event_type",
                value: Some(message.event_type.as_str()),
            })
            .insert(Header {
                key: "aggregate_type",
                value: Some(message.aggregate_type.as_str()),
            })
            .insert(Header {
                key: "created_at",
                value: Some(created_at.as_str()),
            });

        let record = FutureRecord::to(&self.topic)
            .key(&message.key)
            .payload(&payload)
            .headers(headers);

        self.producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(err, _)| EventBusError::PublishFailed(err.to_string()))?;

        tracing::debug!(
            event_id = %message.event_id,
            event_type = %message.event_type,
            key = %message.key,
            "event published"
        );
        Ok(())
    }
}
