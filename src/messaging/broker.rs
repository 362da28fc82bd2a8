//! Broker contract consumed by the ingestion pipeline.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// A message as fetched from the source topic. Payload bytes are kept exactly
/// as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl BrokerMessage {
    /// Message key as text, with invalid UTF-8 replaced
    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

/// Consumer-group side of the broker
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Source topic this broker is subscribed to
    fn topic(&self) -> &str;

    /// Block until a message arrives. Returns `Ok(None)` once `cancel` fires.
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Option<BrokerMessage>>;

    /// Advance the group's committed position past `message`
    async fn acknowledge(&self, message: &BrokerMessage) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Producer side of the broker
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<()>;
}
