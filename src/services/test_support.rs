//! In-memory [`OrderStore`] for exercising the orchestrator and consumer
//! without PostgreSQL.
//!
//! Injected failures surface on the first attempt unless retry policies are
//! installed with [`InMemoryOrderStore::with_retry`], in which case each call
//! runs under them the way the Postgres store does.

use crate::error::{IngestError, Result};
use crate::models::Order;
use crate::resilience::RetryExecutor;
use crate::services::traits::{OrderReader, OrderStore, OrderWriter};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    write_retry: Option<RetryExecutor>,
    read_retry: Option<RetryExecutor>,
    shutdown: CancellationToken,
    orders: RwLock<HashMap<String, Order>>,
    save_calls: AtomicU64,
    read_calls: AtomicU64,
    failing_saves: AtomicU32,
    failing_reads: AtomicU32,
    latency: Mutex<Option<Duration>>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run saves under `write` and reads under `read`
    pub fn with_retry(mut self, write: RetryExecutor, read: RetryExecutor) -> Self {
        self.write_retry = Some(write);
        self.read_retry = Some(read);
        self
    }

    /// Seed an order without counting it as a save
    pub fn insert(&self, order: Order) {
        self.orders.write().insert(order.order_uid.clone(), order);
    }

    /// Peek at a stored order without counting it as a read
    pub fn get(&self, order_uid: &str) -> Option<Order> {
        self.orders.read().get(order_uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.orders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.read().is_empty()
    }

    pub fn save_calls(&self) -> u64 {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_order` calls that reached the store
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Fail the next `count` saves with a connection error
    pub fn fail_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` reads with a connection error
    pub fn fail_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Delay every store call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        let latency = *self.latency.lock();
        latency.unwrap_or_default()
    }

    async fn simulate_latency(&self) {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn budget(&self, retry: Option<&RetryExecutor>) -> Duration {
        retry.map_or(Duration::ZERO, |retry| retry.policy().worst_case(self.latency()))
    }

    async fn get_once(&self, order_uid: &str) -> Result<Order> {
        self.simulate_latency().await;
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_reads) {
            return Err(IngestError::database_connection("injected read failure"));
        }
        self.get(order_uid)
            .ok_or_else(|| IngestError::order_not_found(order_uid))
    }

    async fn get_all_once(&self) -> Result<Vec<Order>> {
        self.simulate_latency().await;
        if Self::take_failure(&self.failing_reads) {
            return Err(IngestError::database_connection("injected read failure"));
        }
        let mut orders: Vec<Order> = self.orders.read().values().cloned().collect();
        orders.sort_by(|a, b| b.date_created.cmp(&a.date_created));
        Ok(orders)
    }

    async fn save_once(&self, order: &Order) -> Result<()> {
        self.simulate_latency().await;
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_saves) {
            return Err(IngestError::database_connection("injected save failure"));
        }
        self.insert(order.clone());
        Ok(())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OrderReader for InMemoryOrderStore {
    async fn get_order(&self, order_uid: &str) -> Result<Order> {
        match &self.read_retry {
            Some(retry) => Ok(retry
                .run("get_order", &self.shutdown, || self.get_once(order_uid))
                .await?),
            None => self.get_once(order_uid).await,
        }
    }

    async fn get_all_orders(&self) -> Result<Vec<Order>> {
        match &self.read_retry {
            Some(retry) => Ok(retry
                .run("get_all_orders", &self.shutdown, || self.get_all_once())
                .await?),
            None => self.get_all_once().await,
        }
    }

    fn read_budget(&self) -> Duration {
        self.budget(self.read_retry.as_ref())
    }
}

#[async_trait]
impl OrderWriter for InMemoryOrderStore {
    async fn save_order(&self, order: &Order) -> Result<()> {
        match &self.write_retry {
            Some(retry) => Ok(retry
                .run("save_order", &self.shutdown, || self.save_once(order))
                .await?),
            None => self.save_once(order).await,
        }
    }

    fn write_budget(&self) -> Duration {
        self.budget(self.write_retry.as_ref())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn init(&self) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.closed.store(true, Ordering::SeqCst);
    }
}
