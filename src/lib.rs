#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Order Ingest
//!
//! Order ingestion and consistency pipeline: orders arrive on a message broker,
//! are decoded and validated, persisted atomically to PostgreSQL and served
//! through an in-memory TTL read-through cache.
//!
//! ## Architecture
//!
//! ```text
//! broker ──▶ OrderConsumer ──▶ OrderService ──▶ PostgresOrderStore
//!               │                   │
//!               ▼                   ▼
//!        DeadLetterPublisher   TtlOrderCache
//! ```
//!
//! - Messages are acknowledged only once their outcome is settled, either
//!   processed or dead-lettered.
//! - An order is cached only after it has been durably committed.
//! - Every store operation runs under a bounded, cancellable retry policy.
//!
//! ## Module Organization
//!
//! - [`models`] - The order aggregate
//! - [`validation`] - Structural and business-rule checks
//! - [`database`] - Pool bring-up, schema ledger and the transactional store
//! - [`cache`] - TTL order cache
//! - [`messaging`] - Broker contract, consumer, dead-lettering and test producer
//! - [`services`] - Capability traits and the `OrderService` orchestrator
//! - [`resilience`] - Retry policies and executor
//! - [`bootstrap`] - Process wiring and graceful shutdown
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust
//! use order_ingest::cache::TtlOrderCache;
//! use order_ingest::messaging::generate_test_order;
//! use order_ingest::services::{test_support::InMemoryOrderStore, OrderService, ServiceSettings};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let service = OrderService::new(
//!     Arc::new(InMemoryOrderStore::new()),
//!     Arc::new(TtlOrderCache::new(Duration::from_secs(60))),
//!     ServiceSettings::default(),
//! );
//!
//! let order = generate_test_order(1);
//! service.process_order(order.clone()).await.unwrap();
//! let cached = service.get_order(&order.order_uid).await.unwrap();
//! assert_eq!(cached.items.len(), order.items.len());
//! service.close().await;
//! # });
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                                  # Unit and in-memory integration tests
//! cargo test --features test-database         # PostgreSQL-backed tests (needs DATABASE_URL)
//! ```

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod resilience;
pub mod services;
pub mod validation;

pub use bootstrap::{IngestBootstrap, IngestComponents, IngestSystemHandle};
pub use cache::TtlOrderCache;
pub use config::IngestConfig;
pub use database::PostgresOrderStore;
pub use error::{IngestError, Result};
pub use messaging::{OrderConsumer, OrderProcessor, ProcessingFailurePolicy};
pub use metrics::IngestMetrics;
pub use models::{Delivery, Item, Order, Payment};
pub use services::{CacheStats, OrderCache, OrderService, OrderStore};
pub use validation::{OrderValidator, ValidationError};
