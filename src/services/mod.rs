//! # Services
//!
//! The orchestration layer and the capability traits it is written against.
//! [`OrderService`] only sees [`OrderStore`] and [`OrderCache`], so the
//! Postgres store and TTL cache can be swapped for in-memory fakes from
//! [`test_support`].

pub mod order_service;
pub mod test_support;
pub mod traits;

pub use order_service::{CacheStats, OrderService, ServiceSettings};
pub use traits::{OrderCache, OrderReader, OrderStore, OrderWriter};
