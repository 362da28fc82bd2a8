//! # Order Service
//!
//! Orchestrates the durable store and the TTL cache. The store is the source of
//! truth: the cache only ever receives aggregates the store has accepted, and a
//! store miss is never cached as a negative result.
//!
//! The service owns a background sweeper that calls [`OrderCache::cleanup`] on a
//! fixed interval. It starts on construction and stops on [`OrderService::close`].

use crate::constants::{cache::DEFAULT_CLEANUP_INTERVAL, timeouts};
use crate::error::{IngestError, Result};
use crate::logging::log_order_operation;
use crate::messaging::consumer::OrderProcessor;
use crate::models::Order;
use crate::services::traits::{OrderCache, OrderStore};
use crate::validation::OrderValidator;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Timeouts, sweep interval and pre-persistence validation.
///
/// The timeouts are floors: a call is given at least the store's own
/// [`write_budget`](crate::services::OrderWriter::write_budget) or
/// [`read_budget`](crate::services::OrderReader::read_budget), so the store's
/// retry policy always runs to exhaustion before the service gives up.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub process_timeout: Duration,
    pub read_timeout: Duration,
    pub cleanup_interval: Duration,
    pub validator: OrderValidator,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            process_timeout: timeouts::PROCESS_ORDER,
            read_timeout: timeouts::READ_ORDER,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            validator: OrderValidator::relaxed(),
        }
    }
}

/// Snapshot returned by [`OrderService::get_cache_stats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub cache_size: usize,
    pub last_request_time: Option<DateTime<Utc>>,
    pub last_request_duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RequestStats {
    last_request_time: Option<DateTime<Utc>>,
    last_request_duration: Duration,
}

#[derive(Debug)]
struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct OrderService {
    store: Arc<dyn OrderStore>,
    cache: Arc<dyn OrderCache>,
    settings: ServiceSettings,
    stats: RwLock<RequestStats>,
    sweeper: Mutex<Option<Sweeper>>,
    closed: AtomicBool,
}

impl OrderService {
    /// Build the service and start the cache sweeper. Must be called inside a
    /// Tokio runtime.
    pub fn new(
        store: Arc<dyn OrderStore>,
        cache: Arc<dyn OrderCache>,
        settings: ServiceSettings,
    ) -> Self {
        let token = CancellationToken::new();
        let handle = spawn_sweeper(cache.clone(), settings.cleanup_interval, token.clone());

        Self {
            store,
            cache,
            settings,
            stats: RwLock::new(RequestStats::default()),
            sweeper: Mutex::new(Some(Sweeper { token, handle })),
            closed: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<dyn OrderCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    /// Bulk-load every stored order into the cache. Returns the cache size.
    pub async fn warm_up_cache(&self) -> Result<usize> {
        let started = Instant::now();
        let orders = self.store.get_all_orders().await?;
        self.cache.load_from_slice(&orders);

        let size = self.cache.size();
        info!(
            orders = size,
            duration_ms = started.elapsed().as_millis() as u64,
            "🔥 Cache warmed up"
        );
        Ok(size)
    }

    /// Validate, persist, then cache. The cache is untouched when persistence fails.
    #[instrument(skip(self, order), fields(order_uid = %order.order_uid))]
    pub async fn process_order(&self, mut order: Order) -> Result<()> {
        let started = Instant::now();
        self.settings.validator.validate(&order)?;
        order.ensure_created_at(Utc::now());

        let budget = call_budget(self.settings.process_timeout, self.store.write_budget());
        tokio::time::timeout(budget, self.store.save_order(&order))
            .await
            .map_err(|_| IngestError::timeout("process_order", budget))??;

        log_order_operation(
            "process_order",
            Some(&order.order_uid),
            "persisted",
            Some(started.elapsed().as_millis() as u64),
            None,
        );
        self.cache.set(order);
        Ok(())
    }

    /// Cache first, then the store with backfill
    pub async fn get_order(&self, order_uid: &str) -> Result<Order> {
        let started = Instant::now();
        self.stats.write().last_request_time = Some(Utc::now());

        let result = self.read_through(order_uid).await;

        self.stats.write().last_request_duration = started.elapsed();
        result
    }

    async fn read_through(&self, order_uid: &str) -> Result<Order> {
        if let Some(order) = self.cache.get(order_uid) {
            debug!(order_uid = %order_uid, "⚡ Cache hit");
            return Ok(order);
        }

        let budget = call_budget(self.settings.read_timeout, self.store.read_budget());
        let order = tokio::time::timeout(budget, self.store.get_order(order_uid))
            .await
            .map_err(|_| IngestError::timeout("get_order", budget))??;

        self.cache.set(order.clone());
        debug!(order_uid = %order_uid, "📥 Cache backfilled from store");
        Ok(order)
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let (last_request_time, last_request_duration) = {
            let stats = self.stats.read();
            (stats.last_request_time, stats.last_request_duration)
        };

        CacheStats {
            cache_size: self.cache.size(),
            last_request_time,
            last_request_duration_ms: last_request_duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    /// Stop the sweeper and close the store. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.token.cancel();
            if let Err(e) = sweeper.handle.await {
                warn!(error = %e, "⚠️ Cache sweeper task ended abnormally");
            }
        }

        self.store.close().await;
        info!("🛑 Order service closed");
    }
}

#[async_trait]
impl OrderProcessor for OrderService {
    async fn process_order(&self, order: Order) -> Result<()> {
        OrderService::process_order(self, order).await
    }
}

/// Configured timeout, raised to cover the store's own retry budget
fn call_budget(configured: Duration, store_budget: Duration) -> Duration {
    if store_budget.is_zero() {
        configured
    } else {
        configured.max(store_budget.saturating_add(timeouts::STORE_BUDGET_GRACE))
    }
}

fn spawn_sweeper(
    cache: Arc<dyn OrderCache>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    let period = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = cache.cleanup();
                    debug!(evicted, remaining = cache.size(), "🧹 Cache sweep complete");
                }
            }
        }
        debug!("Cache sweeper stopped");
    })
}

impl std::fmt::Debug for OrderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderService")
            .field("settings", &self.settings)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
