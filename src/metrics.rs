//! # Pipeline Metrics
//!
//! OpenTelemetry instruments for the ingestion pipeline. Unlike a process-wide
//! registry, an [`IngestMetrics`] bundle is built once from a [`Meter`] and handed
//! to every component that records measurements.
//!
//! When no SDK meter provider is installed the global provider is a no-op, so
//! [`IngestMetrics::disabled`] is always safe to record into.
//!
//! ## Usage
//!
//! ```rust
//! use order_ingest::metrics::IngestMetrics;
//!
//! let metrics = IngestMetrics::disabled();
//! metrics.record_message_received();
//! metrics.record_cache_lookup(true);
//! ```

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use std::fmt;
use std::time::Duration;

/// Instrumentation scope name used when building from the global provider
pub const METER_NAME: &str = "order-ingest";

#[derive(Clone)]
pub struct IngestMetrics {
    // Retry executor
    retry_attempts_total: Counter<u64>,

    // Durable store
    db_saves_total: Counter<u64>,
    db_gets_total: Counter<u64>,
    db_get_all_total: Counter<u64>,
    db_query_errors_total: Counter<u64>,
    db_transaction_errors_total: Counter<u64>,
    db_operation_duration: Histogram<f64>,
    db_query_duration: Histogram<f64>,

    // Broker consumption and dead-lettering
    messages_received_total: Counter<u64>,
    messages_processed_total: Counter<u64>,
    receive_failures_total: Counter<u64>,
    dead_letter_total: Counter<u64>,
    messages_published_total: Counter<u64>,
    message_processing_duration: Histogram<f64>,

    // Cache
    cache_lookups_total: Counter<u64>,
    cache_evictions_total: Counter<u64>,
}

impl IngestMetrics {
    /// Build every instrument from the given meter
    pub fn new(meter: &Meter) -> Self {
        Self {
            retry_attempts_total: meter
                .u64_counter("order_ingest.retry.attempts.total")
                .with_description("Total number of attempts made by the retry executor")
                .build(),
            db_saves_total: meter
                .u64_counter("order_ingest.db.saves.total")
                .with_description("Order save transactions by result")
                .build(),
            db_gets_total: meter
                .u64_counter("order_ingest.db.gets.total")
                .with_description("Single order reads by result")
                .build(),
            db_get_all_total: meter
                .u64_counter("order_ingest.db.get_all.total")
                .with_description("Bulk order reads by result")
                .build(),
            db_query_errors_total: meter
                .u64_counter("order_ingest.db.query.errors.total")
                .with_description("Failed SQL statements by operation")
                .build(),
            db_transaction_errors_total: meter
                .u64_counter("order_ingest.db.transaction.errors.total")
                .with_description("Failed transaction begin/commit calls")
                .build(),
            db_operation_duration: meter
                .f64_histogram("order_ingest.db.operation.duration")
                .with_description("Store operation duration including retries")
                .with_unit("ms")
                .build(),
            db_query_duration: meter
                .f64_histogram("order_ingest.db.query.duration")
                .with_description("Single SQL statement duration")
                .with_unit("ms")
                .build(),
            messages_received_total: meter
                .u64_counter("order_ingest.messages.received.total")
                .with_description("Messages fetched from the broker")
                .build(),
            messages_processed_total: meter
                .u64_counter("order_ingest.messages.processed.total")
                .with_description("Messages by processing outcome")
                .build(),
            receive_failures_total: meter
                .u64_counter("order_ingest.messages.receive_failures.total")
                .with_description("Failed broker fetch calls")
                .build(),
            dead_letter_total: meter
                .u64_counter("order_ingest.dlq.messages.total")
                .with_description("Dead-letter publishes by result")
                .build(),
            messages_published_total: meter
                .u64_counter("order_ingest.messages.published.total")
                .with_description("Orders published by the test producer by result")
                .build(),
            message_processing_duration: meter
                .f64_histogram("order_ingest.message.processing.duration")
                .with_description("Time spent in the processing callback")
                .with_unit("ms")
                .build(),
            cache_lookups_total: meter
                .u64_counter("order_ingest.cache.lookups.total")
                .with_description("Cache lookups by hit or miss")
                .build(),
            cache_evictions_total: meter
                .u64_counter("order_ingest.cache.evictions.total")
                .with_description("Expired entries removed by the sweeper")
                .build(),
        }
    }

    /// Instruments backed by the global meter provider (no-op unless an SDK is installed)
    pub fn disabled() -> Self {
        Self::new(&opentelemetry::global::meter(METER_NAME))
    }

    pub fn record_retry_attempt(&self, operation: &str) {
        self.retry_attempts_total
            .add(1, &[KeyValue::new("operation", operation.to_string())]);
    }

    pub fn record_db_save(&self, success: bool, elapsed: Duration) {
        self.db_saves_total.add(1, &[result_label(success)]);
        self.db_operation_duration.record(
            millis(elapsed),
            &[KeyValue::new("operation", "save_order"), result_label(success)],
        );
    }

    pub fn record_db_get(&self, success: bool, elapsed: Duration) {
        self.db_gets_total.add(1, &[result_label(success)]);
        self.db_operation_duration.record(
            millis(elapsed),
            &[KeyValue::new("operation", "get_order"), result_label(success)],
        );
    }

    pub fn record_db_get_all(&self, success: bool, elapsed: Duration) {
        self.db_get_all_total.add(1, &[result_label(success)]);
        self.db_operation_duration.record(
            millis(elapsed),
            &[KeyValue::new("operation", "get_all_orders"), result_label(success)],
        );
    }

    pub fn record_query(&self, operation: &'static str, success: bool, elapsed: Duration) {
        self.db_query_duration.record(
            millis(elapsed),
            &[KeyValue::new("operation", operation), result_label(success)],
        );
        if !success {
            self.db_query_errors_total
                .add(1, &[KeyValue::new("operation", operation)]);
        }
    }

    pub fn record_transaction_error(&self, stage: &'static str) {
        self.db_transaction_errors_total
            .add(1, &[KeyValue::new("stage", stage)]);
    }

    pub fn record_message_received(&self) {
        self.messages_received_total.add(1, &[]);
    }

    pub fn record_receive_failure(&self) {
        self.receive_failures_total.add(1, &[]);
    }

    /// `outcome` is one of `processed`, `decode_failed`, `invalid`, `processing_failed`
    pub fn record_message_outcome(&self, outcome: &'static str) {
        self.messages_processed_total
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }

    pub fn record_processing_duration(&self, elapsed: Duration, success: bool) {
        self.message_processing_duration
            .record(millis(elapsed), &[result_label(success)]);
    }

    pub fn record_dead_letter(&self, success: bool) {
        self.dead_letter_total.add(1, &[result_label(success)]);
    }

    pub fn record_published(&self, success: bool) {
        self.messages_published_total.add(1, &[result_label(success)]);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let label = if hit { "hit" } else { "miss" };
        self.cache_lookups_total
            .add(1, &[KeyValue::new("result", label)]);
    }

    pub fn record_cache_evictions(&self, evicted: usize) {
        if evicted > 0 {
            self.cache_evictions_total.add(evicted as u64, &[]);
        }
    }
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::disabled()
    }
}

impl fmt::Debug for IngestMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestMetrics")
            .field("meter", &METER_NAME)
            .finish_non_exhaustive()
    }
}

fn result_label(success: bool) -> KeyValue {
    KeyValue::new("result", if success { "success" } else { "error" })
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}
