//! # Kafka Broker
//!
//! [`MessageBroker`] and [`MessagePublisher`] over rdkafka. The consumer runs
//! with auto-commit disabled; [`MessageBroker::acknowledge`] commits
//! `offset + 1` for the message's partition once its outcome is settled.

use crate::constants::timeouts::PUBLISH;
use crate::error::{IngestError, Result};
use crate::messaging::broker::{BrokerMessage, MessageBroker, MessagePublisher};
use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message as KafkaMessage, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Consumer-group member subscribed to one topic
pub struct KafkaBroker {
    consumer: StreamConsumer,
    topic: String,
    closed: AtomicBool,
}

impl KafkaBroker {
    pub fn new(brokers: &[String], group_id: &str, topic: &str) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", group_id)
            .set("enable.auto.commit", "false") // Manual commit on acknowledge
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "10000")
            .create()
            .map_err(|e| IngestError::broker("create_consumer", e.to_string()))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| IngestError::broker("subscribe", e.to_string()))?;

        info!(topic = %topic, group_id = %group_id, "📡 Kafka consumer subscribed");
        Ok(Self {
            consumer,
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Option<BrokerMessage>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IngestError::broker("fetch", "consumer is closed"));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            received = self.consumer.recv() => {
                let message = received.map_err(|e| IngestError::broker("fetch", e.to_string()))?;
                Ok(Some(BrokerMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    timestamp: message
                        .timestamp()
                        .to_millis()
                        .and_then(DateTime::from_timestamp_millis),
                }))
            }
        }
    }

    async fn acknowledge(&self, message: &BrokerMessage) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(|e| IngestError::broker("acknowledge", e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| IngestError::broker("acknowledge", e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.consumer.unsubscribe();
            info!(topic = %self.topic, "🔌 Kafka consumer closed");
        }
        Ok(())
    }
}

/// Topic-agnostic producer used for dead-lettering and test orders
pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(brokers: &[String]) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", PUBLISH.as_millis().to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| IngestError::broker("create_producer", e.to_string()))?;

        Ok(Self {
            producer,
            timeout: PUBLISH,
        })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        self.producer
            .send(record, self.timeout)
            .await
            .map(|_| ())
            .map_err(|(e, _)| IngestError::broker("publish", e.to_string()))
    }
}

impl std::fmt::Debug for KafkaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaBroker")
            .field("topic", &self.topic)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
