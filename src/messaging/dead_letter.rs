//! # Dead-Letter Publisher
//!
//! Redirects unprocessable messages to `<topic>-dlq` with failure metadata.
//! The record carries the original payload bytes untouched (base64 on the
//! wire), so even payloads that never decoded can be replayed verbatim.
//!
//! Publishing is attempted once. This is the terminal failure path, so a
//! publish error is returned to the caller instead of being retried.

use crate::constants::DEAD_LETTER_TOPIC_SUFFIX;
use crate::error::{IngestError, Result};
use crate::messaging::broker::{BrokerMessage, MessagePublisher};
use crate::metrics::IngestMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{error, warn};

/// Dead-letter topic for a source topic
pub fn dead_letter_topic(source_topic: &str) -> String {
    format!("{source_topic}{DEAD_LETTER_TOPIC_SUFFIX}")
}

/// Immutable record written once to the dead-letter topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    #[serde(with = "base64_bytes")]
    original_message: Vec<u8>,
    error: String,
    timestamp: DateTime<Utc>,
    topic: String,
    key: String,
    attempts: u32,
}

impl DeadLetterRecord {
    pub fn new(message: &BrokerMessage, error: impl Display, attempts: u32) -> Self {
        Self {
            original_message: message.payload.clone(),
            error: error.to_string(),
            timestamp: Utc::now(),
            topic: message.topic.clone(),
            key: message.key_str(),
            attempts,
        }
    }

    pub fn original_message(&self) -> &[u8] {
        &self.original_message
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| IngestError::serialization(e.to_string()))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

pub struct DeadLetterPublisher {
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
    metrics: IngestMetrics,
}

impl DeadLetterPublisher {
    /// Publisher targeting the dead-letter topic derived from `source_topic`
    pub fn new(publisher: Arc<dyn MessagePublisher>, source_topic: &str) -> Self {
        Self {
            publisher,
            topic: dead_letter_topic(source_topic),
            metrics: IngestMetrics::disabled(),
        }
    }

    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish `message` with failure metadata, keyed by the original key
    pub async fn send_to_dlq(
        &self,
        message: &BrokerMessage,
        error: impl Display,
        attempts: u32,
    ) -> Result<()> {
        let record = DeadLetterRecord::new(message, error, attempts);
        let payload = record.to_json_bytes()?;

        let result = self
            .publisher
            .publish(&self.topic, &message.key, &payload)
            .await
            .map_err(|e| IngestError::dead_letter(&self.topic, e.to_string()));
        self.metrics.record_dead_letter(result.is_ok());

        match &result {
            Ok(()) => warn!(
                dlq_topic = %self.topic,
                source_topic = %record.topic(),
                key = %record.key(),
                offset = message.offset,
                attempts,
                reason = %record.error(),
                "☠️ Message sent to dead-letter topic"
            ),
            Err(e) => error!(
                dlq_topic = %self.topic,
                key = %record.key(),
                offset = message.offset,
                error = %e,
                "❌ Failed to publish dead-letter record"
            ),
        }
        result
    }
}

impl std::fmt::Debug for DeadLetterPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterPublisher")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::in_memory::InMemoryBroker;

    fn message(payload: &[u8]) -> BrokerMessage {
        BrokerMessage {
            topic: "orders".to_string(),
            partition: 0,
            offset: 7,
            key: b"order-key".to_vec(),
            payload: payload.to_vec(),
            timestamp: None,
        }
    }

    #[test]
    fn test_topic_derivation() {
        assert_eq!(dead_letter_topic("orders"), "orders-dlq");
    }

    #[tokio::test]
    async fn test_record_preserves_original_bytes() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        let dlq = DeadLetterPublisher::new(broker.clone(), "orders");

        let raw = b"{\"not\":\"valid\"\xff";
        dlq.send_to_dlq(&message(raw), "bad json", 1).await.unwrap();

        let published = broker.published_to("orders-dlq");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, b"order-key");

        let record: DeadLetterRecord = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(record.original_message(), raw);
        assert_eq!(record.error(), "bad json");
        assert_eq!(record.topic(), "orders");
        assert_eq!(record.key(), "order-key");
        assert_eq!(record.attempts(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_retried() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        broker.fail_publishes(1);
        let dlq = DeadLetterPublisher::new(broker.clone(), "orders");

        let err = dlq
            .send_to_dlq(&message(b"{}"), "validation failed", 1)
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::DeadLetter { .. }));
        assert!(broker.published().is_empty());
    }

    #[test]
    fn test_record_wire_shape() {
        let record = DeadLetterRecord::new(&message(b"abc"), "boom", 3);
        let value: serde_json::Value =
            serde_json::from_slice(&record.to_json_bytes().unwrap()).unwrap();
        assert_eq!(value["original_message"], "YWJj");
        assert_eq!(value["attempts"], 3);
        assert_eq!(value["topic"], "orders");
        assert!(value["timestamp"].is_string());
    }
}
