//! # Ingestion Consumer
//!
//! The control loop that turns broker messages into persisted orders:
//!
//! ```text
//! Idle → Fetching → Decoding → Validating → Processing → Committing → Fetching …
//!                      │            │             │
//!                      └────────────┴─────────────┴──→ dead-letter → Committing
//! ```
//!
//! Messages are handled strictly one at a time and acknowledged only after
//! their outcome (processed or dead-lettered) is settled. Decode and validation
//! failures are always dead-lettered and acknowledged so a poison message cannot
//! pin the partition. Processing failures follow the configured
//! [`ProcessingFailurePolicy`].

use crate::constants::{timeouts::FETCH_ERROR_BACKOFF, CONSUMER_DEAD_LETTER_ATTEMPTS};
use crate::error::{IngestError, Result};
use crate::messaging::broker::{BrokerMessage, MessageBroker};
use crate::messaging::dead_letter::DeadLetterPublisher;
use crate::metrics::IngestMetrics;
use crate::models::Order;
use crate::validation::OrderValidator;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Business step the consumer hands validated orders to
#[async_trait]
pub trait OrderProcessor: Send + Sync {
    async fn process_order(&self, order: Order) -> Result<()>;
}

/// What to do with a message whose processing failed after retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingFailurePolicy {
    /// Dead-letter and acknowledge, keeping the partition moving
    #[default]
    DeadLetter,
    /// Leave the message unacknowledged and stop the consumer with the error
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Fetching,
    Decoding,
    Validating,
    Processing,
    Committing,
    Cancelled,
}

/// Counters for one consumer's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub processed: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub ack_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    processed: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    ack_failures: AtomicU64,
}

/// Per-message result of the decode/validate/process stages
enum Disposition {
    Acknowledge,
    /// Stop without acknowledging
    Halt(IngestError),
}

pub struct OrderConsumer {
    broker: Arc<dyn MessageBroker>,
    processor: Arc<dyn OrderProcessor>,
    validator: OrderValidator,
    dead_letter: Option<DeadLetterPublisher>,
    failure_policy: ProcessingFailurePolicy,
    metrics: IngestMetrics,
    state: Mutex<ConsumerState>,
    counters: Counters,
}

impl OrderConsumer {
    pub fn new(broker: Arc<dyn MessageBroker>, processor: Arc<dyn OrderProcessor>) -> Self {
        Self {
            broker,
            processor,
            validator: OrderValidator::strict(),
            dead_letter: None,
            failure_policy: ProcessingFailurePolicy::default(),
            metrics: IngestMetrics::disabled(),
            state: Mutex::new(ConsumerState::Idle),
            counters: Counters::default(),
        }
    }

    pub fn with_validator(mut self, validator: OrderValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetterPublisher) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn with_failure_policy(mut self, policy: ProcessingFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            ack_failures: self.counters.ack_failures.load(Ordering::Relaxed),
        }
    }

    fn transition(&self, next: ConsumerState) {
        let mut state = self.state.lock();
        trace!(from = ?*state, to = ?next, "Consumer state transition");
        *state = next;
    }

    /// Consume until `cancel` fires. Returns `Ok(())` on cancellation; returns
    /// an error only when the [`ProcessingFailurePolicy::Block`] policy halts
    /// the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            topic = %self.broker.topic(),
            failure_policy = ?self.failure_policy,
            dead_letter = ?self.dead_letter.as_ref().map(|d| d.topic()),
            "🚀 Order consumer started"
        );

        let outcome = self.consume(&cancel).await;

        self.transition(ConsumerState::Cancelled);
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "⚠️ Failed to close broker connection");
        }

        let stats = self.stats();
        match &outcome {
            Ok(()) => info!(
                received = stats.received,
                processed = stats.processed,
                dead_lettered = stats.dead_lettered,
                "🛑 Order consumer stopped"
            ),
            Err(e) => error!(error = %e, "❌ Order consumer halted"),
        }
        outcome
    }

    async fn consume(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            self.transition(ConsumerState::Fetching);
            let message = match self.broker.fetch(cancel).await {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.metrics.record_receive_failure();
                    warn!(error = %e, "⚠️ Failed to fetch message");
                    if !pause(cancel, FETCH_ERROR_BACKOFF).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            self.counters.received.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_message_received();
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                key = %message.key_str(),
                "📥 Message received"
            );

            match self.handle(&message, cancel).await {
                Disposition::Acknowledge => self.commit(&message).await,
                Disposition::Halt(e) if e.is_cancelled() => {
                    info!(
                        offset = message.offset,
                        "Processing interrupted by shutdown, leaving message unacknowledged"
                    );
                    return Ok(());
                }
                Disposition::Halt(e) => return Err(e),
            }
        }
    }

    async fn handle(&self, message: &BrokerMessage, cancel: &CancellationToken) -> Disposition {
        self.transition(ConsumerState::Decoding);
        let order = match Order::from_json_bytes(&message.payload) {
            Ok(order) => order,
            Err(e) => {
                self.metrics.record_message_outcome("decode_failed");
                return self
                    .reject(message, &IngestError::decode(e.to_string()))
                    .await;
            }
        };

        self.transition(ConsumerState::Validating);
        if let Err(e) = self.validator.validate(&order) {
            self.metrics.record_message_outcome("invalid");
            return self.reject(message, &IngestError::from(e)).await;
        }

        self.transition(ConsumerState::Processing);
        let order_uid = order.order_uid.clone();
        let started = Instant::now();
        let result = self.processor.process_order(order).await;
        self.metrics
            .record_processing_duration(started.elapsed(), result.is_ok());

        match result {
            Ok(()) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_message_outcome("processed");
                info!(
                    order_uid = %order_uid,
                    offset = message.offset,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "✅ Order processed"
                );
                Disposition::Acknowledge
            }
            Err(e) if e.is_cancelled() && cancel.is_cancelled() => Disposition::Halt(e),
            Err(e) => {
                self.metrics.record_message_outcome("processing_failed");
                error!(
                    order_uid = %order_uid,
                    offset = message.offset,
                    error = %e,
                    "❌ Order processing failed"
                );
                match self.failure_policy {
                    ProcessingFailurePolicy::DeadLetter => self.reject(message, &e).await,
                    ProcessingFailurePolicy::Block => Disposition::Halt(e),
                }
            }
        }
    }

    /// Dead-letter (or drop) a message; it is acknowledged either way
    async fn reject(&self, message: &BrokerMessage, reason: &IngestError) -> Disposition {
        match &self.dead_letter {
            Some(dead_letter) => {
                // Publish failures are logged by the publisher; the message is
                // still acknowledged so it cannot be redelivered forever.
                if dead_letter
                    .send_to_dlq(message, reason, CONSUMER_DEAD_LETTER_ATTEMPTS)
                    .await
                    .is_ok()
                {
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    offset = message.offset,
                    key = %message.key_str(),
                    reason = %reason,
                    "⚠️ No dead-letter sink configured, dropping message"
                );
            }
        }
        Disposition::Acknowledge
    }

    async fn commit(&self, message: &BrokerMessage) {
        self.transition(ConsumerState::Committing);
        if let Err(e) = self.broker.acknowledge(message).await {
            self.counters.ack_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                offset = message.offset,
                error = %e,
                "⚠️ Failed to acknowledge message, broker may redeliver"
            );
        }
    }
}

/// Sleep for `delay` unless cancelled first; returns false on cancellation
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

impl std::fmt::Debug for OrderConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderConsumer")
            .field("topic", &self.broker.topic())
            .field("validator", &self.validator)
            .field("dead_letter", &self.dead_letter)
            .field("failure_policy", &self.failure_policy)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::dead_letter::DeadLetterRecord;
    use crate::messaging::in_memory::InMemoryBroker;
    use crate::messaging::producer::generate_test_order;
    use std::time::Duration;

    /// Records processed orders and fails the ones whose uid is listed
    #[derive(Default)]
    struct RecordingProcessor {
        processed: Mutex<Vec<String>>,
        failing: Vec<String>,
    }

    #[async_trait]
    impl OrderProcessor for RecordingProcessor {
        async fn process_order(&self, order: Order) -> Result<()> {
            if self.failing.contains(&order.order_uid) {
                return Err(IngestError::database("save_order", "constraint violated"));
            }
            self.processed.lock().push(order.order_uid);
            Ok(())
        }
    }

    fn consumer(
        broker: &Arc<InMemoryBroker>,
        processor: &Arc<RecordingProcessor>,
    ) -> OrderConsumer {
        OrderConsumer::new(broker.clone(), processor.clone())
            .with_dead_letter(DeadLetterPublisher::new(broker.clone(), "orders"))
    }

    fn payload(index: u64) -> Vec<u8> {
        generate_test_order(index).to_json_bytes().unwrap()
    }

    /// Run the consumer until every pushed message has been acknowledged
    async fn drain(
        consumer: &OrderConsumer,
        broker: &InMemoryBroker,
        expected_acks: usize,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        let run = consumer.run(cancel.clone());
        tokio::pin!(run);

        let deadline = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = &mut deadline => panic!("consumer did not drain in time"),
                _ = tokio::time::sleep(Duration::from_millis(5)) => {
                    if broker.acknowledged().len() >= expected_acks {
                        cancel.cancel();
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_truncated_payload_is_dead_lettered_and_committed() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        let processor = Arc::new(RecordingProcessor::default());
        let raw = br#"{"not":"valid""#;
        broker.push("poison", raw);

        let consumer = consumer(&broker, &processor);
        drain(&consumer, &broker, 1).await.unwrap();

        let dead = broker.published_to("orders-dlq");
        assert_eq!(dead.len(), 1);
        let record: DeadLetterRecord = serde_json::from_slice(&dead[0].payload).unwrap();
        assert_eq!(record.attempts(), 1);
        assert_eq!(record.original_message(), raw);
        assert_eq!(broker.committed_offset(), Some(1));
        assert!(processor.processed.lock().is_empty());
        assert_eq!(consumer.state(), ConsumerState::Cancelled);
        assert!(broker.is_closed());
    }

    #[tokio::test]
    async fn test_poison_messages_do_not_block_good_ones() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        let processor = Arc::new(RecordingProcessor::default());

        broker.push("bad-json", b"{\"not\":\"valid\"");
        broker.push("invalid", br#"{"not":"valid"}"#);
        broker.push("good-1", payload(1));
        broker.push("good-2", payload(2));

        let consumer = consumer(&broker, &processor);
        drain(&consumer, &broker, 4).await.unwrap();

        assert_eq!(broker.published_to("orders-dlq").len(), 2);
        assert_eq!(broker.acknowledged(), vec![0, 1, 2, 3]);
        assert_eq!(
            *processor.processed.lock(),
            vec![
                generate_test_order(1).order_uid,
                generate_test_order(2).order_uid
            ]
        );

        let stats = consumer.stats();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.dead_lettered, 2);
    }

    #[tokio::test]
    async fn test_processing_failure_is_dead_lettered_by_default() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        let failing = generate_test_order(5);
        let processor = Arc::new(RecordingProcessor {
            failing: vec![failing.order_uid.clone()],
            ..Default::default()
        });
        broker.push(&failing.order_uid, failing.to_json_bytes().unwrap());
        broker.push("next", payload(6));

        let consumer = consumer(&broker, &processor);
        drain(&consumer, &broker, 2).await.unwrap();

        let dead = broker.published_to("orders-dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].key, failing.order_uid.as_bytes());
        assert_eq!(processor.processed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_block_policy_halts_without_ack() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        let failing = generate_test_order(5);
        let processor = Arc::new(RecordingProcessor {
            failing: vec![failing.order_uid.clone()],
            ..Default::default()
        });
        broker.push("first", payload(4));
        broker.push(&failing.order_uid, failing.to_json_bytes().unwrap());
        broker.push("never-reached", payload(6));

        let consumer = consumer(&broker, &processor)
            .with_failure_policy(ProcessingFailurePolicy::Block);
        let err = consumer.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, IngestError::Database { .. }));
        assert_eq!(broker.acknowledged(), vec![0]);
        assert!(broker.published_to("orders-dlq").is_empty());
        assert_eq!(broker.pending(), 1);
    }

    #[tokio::test]
    async fn test_without_dead_letter_sink_messages_are_dropped() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        let processor = Arc::new(RecordingProcessor::default());
        broker.push("bad", b"not json");

        let consumer = OrderConsumer::new(broker.clone(), processor.clone());
        drain(&consumer, &broker, 1).await.unwrap();

        assert!(broker.published().is_empty());
        assert_eq!(consumer.stats().dropped, 1);
        assert_eq!(broker.committed_offset(), Some(1));
    }

    #[tokio::test]
    async fn test_dead_letter_failure_still_acknowledges() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        let processor = Arc::new(RecordingProcessor::default());
        broker.fail_publishes(1);
        broker.push("bad", b"not json");

        let consumer = consumer(&broker, &processor);
        drain(&consumer, &broker, 1).await.unwrap();

        assert!(broker.published().is_empty());
        assert_eq!(broker.acknowledged(), vec![0]);
    }

    #[tokio::test]
    async fn test_ack_failure_does_not_stop_consumer() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        let processor = Arc::new(RecordingProcessor::default());
        broker.fail_acks(1);
        broker.push("a", payload(1));
        broker.push("b", payload(2));

        let consumer = consumer(&broker, &processor);
        drain(&consumer, &broker, 1).await.unwrap();

        assert_eq!(processor.processed.lock().len(), 2);
        assert_eq!(broker.acknowledged(), vec![1]);
        assert_eq!(consumer.stats().ack_failures, 1);
    }

    #[tokio::test]
    async fn test_relaxed_validator_accepts_short_uid() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        let processor = Arc::new(RecordingProcessor::default());
        let mut order = generate_test_order(9);
        order.order_uid = "b563feb7b2b84b6test".to_string();
        broker.push(&order.order_uid, order.to_json_bytes().unwrap());

        let consumer = consumer(&broker, &processor).with_validator(OrderValidator::relaxed());
        drain(&consumer, &broker, 1).await.unwrap();

        assert_eq!(*processor.processed.lock(), vec!["b563feb7b2b84b6test".to_string()]);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_idle_returns_cleanly() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        let processor = Arc::new(RecordingProcessor::default());
        let consumer = consumer(&broker, &processor);

        let cancel = CancellationToken::new();
        cancel.cancel();
        consumer.run(cancel).await.unwrap();

        assert_eq!(consumer.state(), ConsumerState::Cancelled);
        assert!(broker.is_closed());
    }
}
