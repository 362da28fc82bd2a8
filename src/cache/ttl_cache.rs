use crate::constants::cache::DEFAULT_TTL;
use crate::metrics::IngestMetrics;
use crate::models::Order;
use crate::services::traits::OrderCache;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A cached aggregate and the instant it stops being served
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub order: Order,
    pub expires_at: Instant,
}

impl CachedEntry {
    fn new(order: Order, ttl: Duration) -> Self {
        Self {
            order,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Order cache with per-entry expiry under one reader/writer lock.
///
/// Expired entries are treated as absent on read but stay in the map until
/// [`OrderCache::cleanup`] sweeps them. Clones share the same map.
#[derive(Debug, Clone)]
pub struct TtlOrderCache {
    entries: Arc<RwLock<HashMap<String, CachedEntry>>>,
    ttl: Duration,
    metrics: IngestMetrics,
}

impl Default for TtlOrderCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl TtlOrderCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            metrics: IngestMetrics::disabled(),
        }
    }

    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Entries in the backing map, expired ones included
    pub fn raw_len(&self) -> usize {
        self.entries.read().len()
    }
}

impl OrderCache for TtlOrderCache {
    fn set(&self, order: Order) {
        let key = order.order_uid.clone();
        let entry = CachedEntry::new(order, self.ttl);
        self.entries.write().insert(key, entry);
    }

    fn get(&self, order_uid: &str) -> Option<Order> {
        let now = Instant::now();
        let found = {
            let entries = self.entries.read();
            entries
                .get(order_uid)
                .filter(|entry| !entry.is_expired(now))
                .map(|entry| entry.order.clone())
        };
        self.metrics.record_cache_lookup(found.is_some());
        found
    }

    fn get_all(&self) -> Vec<Order> {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.order.clone())
            .collect()
    }

    fn size(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    fn load_from_slice(&self, orders: &[Order]) {
        let mut entries = self.entries.write();
        for order in orders {
            entries.insert(
                order.order_uid.clone(),
                CachedEntry::new(order.clone(), self.ttl),
            );
        }
        debug!(count = orders.len(), "Loaded orders into cache");
    }

    fn cleanup(&self) -> usize {
        let now = Instant::now();
        let evicted = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            before - entries.len()
        };
        self.metrics.record_cache_evictions(evicted);
        if evicted > 0 {
            debug!(evicted, "🧹 Evicted expired cache entries");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::producer::generate_test_order;
    use std::thread;

    #[test]
    fn test_set_and_get() {
        let cache = TtlOrderCache::new(Duration::from_secs(60));
        let order = generate_test_order(1);
        cache.set(order.clone());

        assert_eq!(cache.get(&order.order_uid), Some(order));
        assert_eq!(cache.get("missing"), None);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_set_overwrites_without_merge() {
        let cache = TtlOrderCache::new(Duration::from_secs(60));
        let mut order = generate_test_order(1);
        cache.set(order.clone());

        order.items.truncate(1);
        order.items[0].price = 999;
        cache.set(order.clone());

        let cached = cache.get(&order.order_uid).unwrap();
        assert_eq!(cached.items.len(), 1);
        assert_eq!(cached.items[0].price, 999);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_lazy_expiry_then_cleanup() {
        let cache = TtlOrderCache::new(Duration::from_millis(30));
        let order = generate_test_order(2);
        cache.set(order.clone());
        assert_eq!(cache.size(), 1);

        thread::sleep(Duration::from_millis(60));

        // Expired but still in the backing map
        assert_eq!(cache.get(&order.order_uid), None);
        assert_eq!(cache.size(), 0);
        assert!(cache.get_all().is_empty());
        assert_eq!(cache.raw_len(), 1);

        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.raw_len(), 0);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_cleanup_keeps_live_entries() {
        let cache = TtlOrderCache::new(Duration::from_secs(60));
        cache.load_from_slice(&[generate_test_order(1), generate_test_order(2)]);
        assert_eq!(cache.cleanup(), 0);
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn test_load_from_slice_overwrites() {
        let cache = TtlOrderCache::new(Duration::from_secs(60));
        let orders: Vec<Order> = (0..100).map(generate_test_order).collect();
        cache.load_from_slice(&orders);
        assert_eq!(cache.size(), 100);

        cache.load_from_slice(&orders[..10]);
        assert_eq!(cache.size(), 100);
        assert_eq!(cache.get_all().len(), 100);
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = TtlOrderCache::new(Duration::from_secs(60));
        let clone = cache.clone();
        let order = generate_test_order(3);
        clone.set(order.clone());
        assert_eq!(cache.get(&order.order_uid), Some(order));
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let cache = TtlOrderCache::new(Duration::from_secs(60));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        let order = generate_test_order(worker * 1000 + i);
                        cache.set(order.clone());
                        assert_eq!(cache.get(&order.order_uid), Some(order));
                        let _ = cache.size();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.size(), 400);
    }
}
