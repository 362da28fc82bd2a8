//! Capability interfaces the orchestrator depends on.
//!
//! The durable store is split into a read side and a write side so components can
//! be handed only what they use. The cache contract is synchronous: it never
//! performs I/O and its lock is never held across a suspension point.

use crate::error::Result;
use crate::models::Order;
use async_trait::async_trait;
use std::time::Duration;

/// Read side of the durable store
#[async_trait]
pub trait OrderReader: Send + Sync {
    /// Load one aggregate. A missing identifier yields
    /// [`IngestError::OrderNotFound`](crate::error::IngestError::OrderNotFound).
    async fn get_order(&self, order_uid: &str) -> Result<Order>;

    /// Load every aggregate, newest first. Used for cache warm-up only.
    async fn get_all_orders(&self) -> Result<Vec<Order>>;

    /// Longest `get_order` can take once its own retries are exhausted.
    /// Callers never bound a read tighter than this.
    fn read_budget(&self) -> Duration {
        Duration::ZERO
    }
}

/// Write side of the durable store
#[async_trait]
pub trait OrderWriter: Send + Sync {
    /// Persist the whole aggregate atomically, replacing any previous item list
    async fn save_order(&self, order: &Order) -> Result<()>;

    /// Longest `save_order` can take once its own retries are exhausted
    fn write_budget(&self) -> Duration {
        Duration::ZERO
    }
}

/// Full durable store lifecycle
#[async_trait]
pub trait OrderStore: OrderReader + OrderWriter {
    /// Create the schema if needed. Safe to call on every start.
    async fn init(&self) -> Result<()>;

    /// Release pooled resources. Idempotent.
    async fn close(&self);
}

/// Expiring in-memory view of the store
pub trait OrderCache: Send + Sync {
    fn set(&self, order: Order);

    /// `None` when absent or expired
    fn get(&self, order_uid: &str) -> Option<Order>;

    fn get_all(&self) -> Vec<Order>;

    /// Number of live (non-expired) entries
    fn size(&self) -> usize;

    fn load_from_slice(&self, orders: &[Order]);

    /// Drop expired entries from the backing map, returning how many were removed
    fn cleanup(&self) -> usize;
}
