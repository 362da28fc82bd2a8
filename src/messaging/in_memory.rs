//! In-process broker for tests and local runs.
//!
//! A single topic-partition queue with recorded acknowledgements and publishes.
//! Failures can be injected per operation to exercise the consumer's error paths.

use crate::error::{IngestError, Result};
use crate::messaging::broker::{BrokerMessage, MessageBroker, MessagePublisher};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A message handed to [`MessagePublisher::publish`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queue: VecDeque<BrokerMessage>,
    next_offset: i64,
    acknowledged: Vec<i64>,
    published: Vec<PublishedMessage>,
    closed: bool,
    failing_fetches: u32,
    failing_acks: u32,
    failing_publishes: u32,
}

#[derive(Debug)]
pub struct InMemoryBroker {
    topic: String,
    state: Mutex<BrokerState>,
    available: Notify,
}

impl InMemoryBroker {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: Mutex::new(BrokerState::default()),
            available: Notify::new(),
        }
    }

    /// Append a message to the source topic, returning its offset
    pub fn push(&self, key: impl AsRef<[u8]>, payload: impl AsRef<[u8]>) -> i64 {
        let offset = {
            let mut state = self.state.lock();
            let offset = state.next_offset;
            state.next_offset += 1;
            state.queue.push_back(BrokerMessage {
                topic: self.topic.clone(),
                partition: 0,
                offset,
                key: key.as_ref().to_vec(),
                payload: payload.as_ref().to_vec(),
                timestamp: Some(Utc::now()),
            });
            offset
        };
        self.available.notify_one();
        offset
    }

    /// Messages not yet fetched
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Offsets acknowledged so far, in acknowledgement order
    pub fn acknowledged(&self) -> Vec<i64> {
        self.state.lock().acknowledged.clone()
    }

    /// Next offset the group would read after a restart
    pub fn committed_offset(&self) -> Option<i64> {
        self.state
            .lock()
            .acknowledged
            .iter()
            .max()
            .map(|offset| offset + 1)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Fail the next `count` fetch calls
    pub fn fail_fetches(&self, count: u32) {
        self.state.lock().failing_fetches = count;
    }

    /// Fail the next `count` acknowledgements
    pub fn fail_acks(&self, count: u32) {
        self.state.lock().failing_acks = count;
    }

    /// Fail the next `count` publishes
    pub fn fail_publishes(&self, count: u32) {
        self.state.lock().failing_publishes = count;
    }

    fn try_pop(&self) -> Result<Option<BrokerMessage>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(IngestError::broker("fetch", "broker is closed"));
        }
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(IngestError::broker("fetch", "injected fetch failure"));
        }
        Ok(state.queue.pop_front())
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Option<BrokerMessage>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(message) = self.try_pop()? {
                return Ok(Some(message));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = self.available.notified() => {}
            }
        }
    }

    async fn acknowledge(&self, message: &BrokerMessage) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_acks > 0 {
            state.failing_acks -= 1;
            return Err(IngestError::broker("acknowledge", "injected commit failure"));
        }
        state.acknowledged.push(message.offset);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(IngestError::broker("publish", "injected publish failure"));
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            key: key.to_vec(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fetch_in_offset_order() {
        let broker = InMemoryBroker::new("orders");
        broker.push("a", b"one");
        broker.push("b", b"two");

        let cancel = CancellationToken::new();
        let first = broker.fetch(&cancel).await.unwrap().unwrap();
        let second = broker.fetch(&cancel).await.unwrap().unwrap();
        assert_eq!((first.offset, first.payload.as_slice()), (0, &b"one"[..]));
        assert_eq!((second.offset, second.key_str().as_str()), (1, "b"));
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn test_fetch_waits_for_push() {
        let broker = Arc::new(InMemoryBroker::new("orders"));
        let cancel = CancellationToken::new();

        let pusher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push("k", b"late");
        });

        let message = tokio::time::timeout(Duration::from_secs(2), broker.fetch(&cancel))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, b"late");
    }

    #[tokio::test]
    async fn test_fetch_returns_none_on_cancel() {
        let broker = InMemoryBroker::new("orders");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        assert_eq!(broker.fetch(&cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let broker = InMemoryBroker::new("orders");
        broker.push("k", b"v");
        broker.fail_fetches(1);
        broker.fail_acks(1);
        broker.fail_publishes(1);

        let cancel = CancellationToken::new();
        assert!(broker.fetch(&cancel).await.is_err());
        let message = broker.fetch(&cancel).await.unwrap().unwrap();

        assert!(broker.acknowledge(&message).await.is_err());
        broker.acknowledge(&message).await.unwrap();
        assert_eq!(broker.committed_offset(), Some(1));

        assert!(broker.publish("orders-dlq", b"k", b"v").await.is_err());
        broker.publish("orders-dlq", b"k", b"v").await.unwrap();
        assert_eq!(broker.published_to("orders-dlq").len(), 1);
    }
}
