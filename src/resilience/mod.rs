//! # Resilience Module
//!
//! Fault tolerance for every fallible operation in the pipeline: store writes and
//! reads, schema initialization, connection bring-up and broker publishes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use order_ingest::resilience::{RetryExecutor, RetryPolicy};
//! use order_ingest::error::IngestError;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), IngestError> {
//! let shutdown = CancellationToken::new();
//! let executor = RetryExecutor::new(RetryPolicy::heavy());
//!
//! let rows = executor
//!     .run("count_orders", &shutdown, || async {
//!         // Database operation here
//!         Ok::<u64, IngestError>(0)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod retry;

pub use retry::{RetryError, RetryExecutor, RetryPolicy, Retryable};
