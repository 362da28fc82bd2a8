//! Synthetic order producer for demos and load generation.

use crate::error::{IngestError, Result};
use crate::messaging::broker::MessagePublisher;
use crate::metrics::IngestMetrics;
use crate::models::{Delivery, Item, Order, Payment};
use crate::resilience::RetryExecutor;
use crate::validation::OrderValidator;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BASE_PAYMENT_DT: i64 = 1_637_907_727;
const SIZES: [&str; 5] = ["XS", "S", "M", "L", "XL"];

/// Deterministic order that passes strict validation. `index` drives every
/// derived value, so equal indices produce equal orders.
pub fn generate_test_order(index: u64) -> Order {
    let track_number = format!("TRACK{index:010}");
    let payment_dt = BASE_PAYMENT_DT + (index % 1_000_000) as i64;
    let i = index as i64;

    let item_count = 1 + index % 5;
    let items = (0..item_count as i64)
        .map(|n| {
            let price = 100 + (i * 10 + n * 5) % 1000;
            Item {
                chrt_id: 1_000_000 + (i * 100 + n * 10) % 8_000_000,
                track_number: track_number.clone(),
                price,
                rid: format!("rid{index}x{n}"),
                name: format!("Test item {n}"),
                sale: ((i + n) % 50) as i32,
                size: SIZES[(n as usize) % SIZES.len()].to_string(),
                total_price: price + (i * 5 + n * 3) % 500,
                nm_id: 100_000_000 + (i * 1000 + n * 100) % 800_000_000,
                brand: "TestBrand".to_string(),
                status: 202,
            }
        })
        .collect();

    let amount = 100 + (i * 10) % 10_000;
    let delivery_cost = 20 + (i * 2) % 500;
    let mut goods_total = amount - delivery_cost;
    if goods_total <= 0 {
        goods_total = amount - 50;
    }

    Order {
        order_uid: format!("testorderuid{index:020}"),
        track_number,
        entry: "TestEntry".to_string(),
        delivery: Delivery {
            name: format!("Test Customer {index}"),
            phone: format!("+1000{:07}", index % 10_000_000),
            zip: format!("{}", 10_000 + index % 90_000),
            city: "Test City".to_string(),
            address: format!("{index} Test Street"),
            region: "Test Region".to_string(),
            email: format!("test{index}@example.com"),
        },
        payment: Payment {
            transaction: format!("trans_{index}"),
            request_id: String::new(),
            currency: "USD".to_string(),
            provider: "provider_test".to_string(),
            amount,
            payment_dt,
            bank: "TestBank".to_string(),
            delivery_cost,
            goods_total,
            custom_fee: 0,
        },
        items,
        locale: "en".to_string(),
        internal_signature: String::new(),
        customer_id: format!("customer_{index}"),
        delivery_service: "delivery_service".to_string(),
        shardkey: format!("shard_{index}"),
        sm_id: 1 + (index % 999_999) as i32,
        date_created: DateTime::<Utc>::from_timestamp(payment_dt, 0),
        oof_shard: format!("oof_shard_{index}"),
    }
}

/// Publishes orders as JSON keyed by `order_uid` under the light retry policy
pub struct OrderProducer {
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
    validator: OrderValidator,
    retry: RetryExecutor,
    metrics: IngestMetrics,
}

impl OrderProducer {
    pub fn new(publisher: Arc<dyn MessagePublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            validator: OrderValidator::strict(),
            retry: RetryExecutor::light(),
            metrics: IngestMetrics::disabled(),
        }
    }

    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.retry = self.retry.with_metrics(metrics.clone());
        self.metrics = metrics;
        self
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Validate, serialize and publish one order
    pub async fn send_order(&self, order: &Order, cancel: &CancellationToken) -> Result<()> {
        self.validator.validate(order)?;
        let payload = order
            .to_json_bytes()
            .map_err(|e| IngestError::serialization(e.to_string()))?;
        let key = order.order_uid.as_bytes();

        let result = self
            .retry
            .run("publish_order", cancel, || {
                self.publisher.publish(&self.topic, key, &payload)
            })
            .await
            .map_err(IngestError::from);
        self.metrics.record_published(result.is_ok());

        if result.is_ok() {
            debug!(order_uid = %order.order_uid, topic = %self.topic, "📤 Order published");
        }
        result
    }

    /// Publish a fresh synthetic order every `interval` until cancelled
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        info!(topic = %self.topic, interval_secs = interval.as_secs(), "🚀 Test order producer started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        let mut index: u64 = 1;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let mut order = generate_test_order(index);
                    order.date_created = Some(Utc::now());
                    match self.send_order(&order, &cancel).await {
                        Ok(()) => info!(order_uid = %order.order_uid, "📤 Sent test order"),
                        Err(e) => warn!(order_uid = %order.order_uid, error = %e, "⚠️ Failed to send test order"),
                    }
                    index += 1;
                }
            }
        }

        info!(sent = index - 1, "🛑 Test order producer stopped");
    }
}

impl std::fmt::Debug for OrderProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderProducer")
            .field("topic", &self.topic)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
