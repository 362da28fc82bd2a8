//! In-memory order cache with lazy per-entry expiry and an eager sweep.

pub mod ttl_cache;

pub use ttl_cache::{CachedEntry, TtlOrderCache};
