//! # Postgres Order Store
//!
//! Transactional persistence of the order aggregate. A save upserts the header,
//! delivery and payment rows, then replaces the item list wholesale, all inside
//! one transaction. Reads join header, delivery and payment in a single round
//! trip and fetch items with a second ordered query.
//!
//! Writes and schema initialization run under the heavy retry policy, reads
//! under the standard one. A retried save re-runs the entire transaction.
//! The pool's acquire timeout bounds an attempt against an unreachable server,
//! and the store reports the resulting worst case as its read and write budget.

use crate::constants::database::ITEM_LOAD_CONCURRENCY;
use crate::database::migrations::DatabaseMigrations;
use crate::error::{IngestError, Result};
use crate::metrics::IngestMetrics;
use crate::models::{Item, Order};
use crate::resilience::RetryExecutor;
use crate::services::traits::{OrderReader, OrderStore, OrderWriter};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::{PgConnection, PgPool};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

const UPSERT_ORDER: &str = r#"
    INSERT INTO orders (
        order_uid, track_number, entry, locale, internal_signature, customer_id,
        delivery_service, shardkey, sm_id, date_created, oof_shard
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (order_uid) DO UPDATE SET
        track_number = EXCLUDED.track_number,
        entry = EXCLUDED.entry,
        locale = EXCLUDED.locale,
        internal_signature = EXCLUDED.internal_signature,
        customer_id = EXCLUDED.customer_id,
        delivery_service = EXCLUDED.delivery_service,
        shardkey = EXCLUDED.shardkey,
        sm_id = EXCLUDED.sm_id,
        date_created = EXCLUDED.date_created,
        oof_shard = EXCLUDED.oof_shard
"#;

const UPSERT_DELIVERY: &str = r#"
    INSERT INTO delivery (order_uid, name, phone, zip, city, address, region, email)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (order_uid) DO UPDATE SET
        name = EXCLUDED.name,
        phone = EXCLUDED.phone,
        zip = EXCLUDED.zip,
        city = EXCLUDED.city,
        address = EXCLUDED.address,
        region = EXCLUDED.region,
        email = EXCLUDED.email
"#;

const UPSERT_PAYMENT: &str = r#"
    INSERT INTO payment (
        order_uid, transaction, request_id, currency, provider, amount,
        payment_dt, bank, delivery_cost, goods_total, custom_fee
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (order_uid) DO UPDATE SET
        transaction = EXCLUDED.transaction,
        request_id = EXCLUDED.request_id,
        currency = EXCLUDED.currency,
        provider = EXCLUDED.provider,
        amount = EXCLUDED.amount,
        payment_dt = EXCLUDED.payment_dt,
        bank = EXCLUDED.bank,
        delivery_cost = EXCLUDED.delivery_cost,
        goods_total = EXCLUDED.goods_total,
        custom_fee = EXCLUDED.custom_fee
"#;

const DELETE_ITEMS: &str = "DELETE FROM items WHERE order_uid = $1";

const INSERT_ITEM: &str = r#"
    INSERT INTO items (
        order_uid, chrt_id, track_number, price, rid, name, sale, size,
        total_price, nm_id, brand, status
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
"#;

const SELECT_ORDER_HEADER: &str = r#"
    SELECT
        o.order_uid, o.track_number, o.entry, o.locale, o.internal_signature,
        o.customer_id, o.delivery_service, o.shardkey, o.sm_id, o.date_created, o.oof_shard,
        d.name, d.phone, d.zip, d.city, d.address, d.region, d.email,
        p.transaction, p.request_id, p.currency, p.provider, p.amount, p.payment_dt,
        p.bank, p.delivery_cost, p.goods_total, p.custom_fee
    FROM orders o
    JOIN delivery d ON d.order_uid = o.order_uid
    JOIN payment p ON p.order_uid = o.order_uid
"#;

const SELECT_ITEMS: &str = r#"
    SELECT chrt_id, track_number, price, rid, name, sale, size, total_price, nm_id, brand, status
    FROM items
    WHERE order_uid = $1
    ORDER BY id
"#;

/// [`OrderStore`] backed by a shared Postgres pool
#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
    metrics: IngestMetrics,
    write_retry: RetryExecutor,
    read_retry: RetryExecutor,
    shutdown: CancellationToken,
    attempt_timeout: Duration,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool, metrics: IngestMetrics) -> Self {
        Self {
            write_retry: RetryExecutor::heavy().with_metrics(metrics.clone()),
            read_retry: RetryExecutor::standard().with_metrics(metrics.clone()),
            attempt_timeout: pool.options().get_acquire_timeout(),
            pool,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop retry loops when `token` fires. The store also cancels its own
    /// child token on [`OrderStore::close`].
    pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
        self.shutdown = token.child_token();
        self
    }

    /// Override the write and read policies
    pub fn with_retry(mut self, write: RetryExecutor, read: RetryExecutor) -> Self {
        self.write_retry = write;
        self.read_retry = read;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn timed<T, F>(&self, operation: &'static str, query: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let result = query.await;
        self.metrics
            .record_query(operation, result.is_ok(), started.elapsed());
        result.map_err(|e| IngestError::from_sqlx(operation, e))
    }

    /// One attempt at the save transaction. Dropping `tx` on an early return
    /// rolls it back; a committed transaction is consumed and never rolled back.
    async fn save_once(&self, order: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            self.metrics.record_transaction_error("begin");
            IngestError::from_sqlx("begin_transaction", e)
        })?;

        self.write_aggregate(&mut tx, order).await?;

        tx.commit().await.map_err(|e| {
            self.metrics.record_transaction_error("commit");
            IngestError::from_sqlx("commit_transaction", e)
        })
    }

    async fn write_aggregate(&self, conn: &mut PgConnection, order: &Order) -> Result<()> {
        let uid = order.order_uid.as_str();
        let date_created = order.date_created.unwrap_or_else(Utc::now);

        self.timed(
            "upsert_order",
            sqlx::query(UPSERT_ORDER)
                .bind(uid)
                .bind(&order.track_number)
                .bind(&order.entry)
                .bind(&order.locale)
                .bind(&order.internal_signature)
                .bind(&order.customer_id)
                .bind(&order.delivery_service)
                .bind(&order.shardkey)
                .bind(order.sm_id)
                .bind(date_created)
                .bind(&order.oof_shard)
                .execute(&mut *conn),
        )
        .await?;

        let delivery = &order.delivery;
        self.timed(
            "upsert_delivery",
            sqlx::query(UPSERT_DELIVERY)
                .bind(uid)
                .bind(&delivery.name)
                .bind(&delivery.phone)
                .bind(&delivery.zip)
                .bind(&delivery.city)
                .bind(&delivery.address)
                .bind(&delivery.region)
                .bind(&delivery.email)
                .execute(&mut *conn),
        )
        .await?;

        let payment = &order.payment;
        self.timed(
            "upsert_payment",
            sqlx::query(UPSERT_PAYMENT)
                .bind(uid)
                .bind(&payment.transaction)
                .bind(&payment.request_id)
                .bind(&payment.currency)
                .bind(&payment.provider)
                .bind(payment.amount)
                .bind(payment.payment_dt)
                .bind(&payment.bank)
                .bind(payment.delivery_cost)
                .bind(payment.goods_total)
                .bind(payment.custom_fee)
                .execute(&mut *conn),
        )
        .await?;

        self.timed(
            "delete_items",
            sqlx::query(DELETE_ITEMS).bind(uid).execute(&mut *conn),
        )
        .await?;

        for item in &order.items {
            self.timed(
                "insert_item",
                sqlx::query(INSERT_ITEM)
                    .bind(uid)
                    .bind(item.chrt_id)
                    .bind(&item.track_number)
                    .bind(item.price)
                    .bind(&item.rid)
                    .bind(&item.name)
                    .bind(item.sale)
                    .bind(&item.size)
                    .bind(item.total_price)
                    .bind(item.nm_id)
                    .bind(&item.brand)
                    .bind(item.status)
                    .execute(&mut *conn),
            )
            .await?;
        }

        Ok(())
    }

    async fn load_items(&self, order_uid: &str) -> Result<Vec<Item>> {
        self.timed(
            "select_items",
            sqlx::query_as::<_, Item>(SELECT_ITEMS)
                .bind(order_uid)
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn get_once(&self, order_uid: &str) -> Result<Order> {
        let header = self
            .timed(
                "select_order",
                sqlx::query_as::<_, Order>(&format!(
                    "{SELECT_ORDER_HEADER} WHERE o.order_uid = $1"
                ))
                .bind(order_uid)
                .fetch_optional(&self.pool),
            )
            .await?;

        let mut order = header.ok_or_else(|| IngestError::order_not_found(order_uid))?;
        order.items = self.load_items(order_uid).await?;
        Ok(order)
    }

    async fn get_all_once(&self) -> Result<Vec<Order>> {
        let mut orders = self
            .timed(
                "select_all_orders",
                sqlx::query_as::<_, Order>(&format!(
                    "{SELECT_ORDER_HEADER} ORDER BY o.date_created DESC"
                ))
                .fetch_all(&self.pool),
            )
            .await?;

        // One item query per order; this path only runs at warm-up
        let uids: Vec<String> = orders.iter().map(|o| o.order_uid.clone()).collect();
        let items: Vec<Vec<Item>> = stream::iter(uids)
            .map(|order_uid| {
                let store = self.clone();
                async move { store.load_items(&order_uid).await }
            })
            .buffered(ITEM_LOAD_CONCURRENCY)
            .try_collect()
            .await?;
        for (order, items) in orders.iter_mut().zip(items) {
            order.items = items;
        }
        Ok(orders)
    }
}

#[async_trait]
impl OrderWriter for PostgresOrderStore {
    #[instrument(skip(self, order), fields(order_uid = %order.order_uid))]
    async fn save_order(&self, order: &Order) -> Result<()> {
        let started = Instant::now();
        let result = self
            .write_retry
            .run("save_order", &self.shutdown, || self.save_once(order))
            .await
            .map_err(IngestError::from);
        self.metrics.record_db_save(result.is_ok(), started.elapsed());

        match &result {
            Ok(()) => debug!(
                items = order.items.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "💾 Order saved"
            ),
            Err(e) => error!(error = %e, "❌ Failed to save order"),
        }
        result
    }

    fn write_budget(&self) -> Duration {
        self.write_retry.policy().worst_case(self.attempt_timeout)
    }
}

#[async_trait]
impl OrderReader for PostgresOrderStore {
    #[instrument(skip(self))]
    async fn get_order(&self, order_uid: &str) -> Result<Order> {
        let started = Instant::now();
        let result = self
            .read_retry
            .run("get_order", &self.shutdown, || self.get_once(order_uid))
            .await
            .map_err(IngestError::from);
        self.metrics.record_db_get(result.is_ok(), started.elapsed());

        if let Err(e) = &result {
            if !e.is_not_found() {
                error!(error = %e, "❌ Failed to load order");
            }
        }
        result
    }

    async fn get_all_orders(&self) -> Result<Vec<Order>> {
        let started = Instant::now();
        let result = self
            .read_retry
            .run("get_all_orders", &self.shutdown, || self.get_all_once())
            .await
            .map_err(IngestError::from);
        self.metrics
            .record_db_get_all(result.is_ok(), started.elapsed());

        match &result {
            Ok(orders) => info!(count = orders.len(), "📚 Loaded all orders"),
            Err(e) => error!(error = %e, "❌ Failed to load all orders"),
        }
        result
    }

    fn read_budget(&self) -> Duration {
        self.read_retry.policy().worst_case(self.attempt_timeout)
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn init(&self) -> Result<()> {
        let applied = self
            .write_retry
            .run("init_schema", &self.shutdown, || {
                let pool = self.pool.clone();
                async move { DatabaseMigrations::run_all(pool).await }
            })
            .await
            .map_err(IngestError::from)?;

        info!(applied = applied.len(), "✅ Database schema ready");
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("🔌 Database pool closed");
        }
    }
}
