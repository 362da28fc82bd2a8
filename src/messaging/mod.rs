//! # Messaging Module
//!
//! Broker-facing half of the pipeline: the broker contract, the ingestion
//! consumer, dead-lettering and the synthetic order producer.
//!
//! The Kafka implementation is compiled with the `kafka` feature; the
//! in-memory broker is always available for tests and local runs.

pub mod broker;
pub mod consumer;
pub mod dead_letter;
pub mod in_memory;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod producer;

pub use broker::{BrokerMessage, MessageBroker, MessagePublisher};
pub use consumer::{
    ConsumerState, ConsumerStats, OrderConsumer, OrderProcessor, ProcessingFailurePolicy,
};
pub use dead_letter::{dead_letter_topic, DeadLetterPublisher, DeadLetterRecord};
pub use in_memory::{InMemoryBroker, PublishedMessage};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaPublisher};
pub use producer::{generate_test_order, OrderProducer};
