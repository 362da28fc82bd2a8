//! PostgreSQL-backed store tests
//!
//! Each test gets an isolated database from `#[sqlx::test]`; the schema is
//! created by `OrderStore::init` rather than sqlx's migrator. Requires
//! `DATABASE_URL` and `--features test-database`.

#![cfg(feature = "test-database")]

use order_ingest::cache::TtlOrderCache;
use order_ingest::database::{DatabaseMigrations, PostgresOrderStore, MIGRATIONS};
use order_ingest::messaging::generate_test_order;
use order_ingest::services::{OrderReader, OrderService, OrderStore, OrderWriter, ServiceSettings};
use order_ingest::{IngestError, IngestMetrics, Order};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

async fn store(pool: &PgPool) -> PostgresOrderStore {
    let store = PostgresOrderStore::new(pool.clone(), IngestMetrics::disabled());
    store.init().await.expect("schema init");
    store
}

async fn count(pool: &PgPool, table: &str, order_uid: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(*) FROM {table} WHERE order_uid = $1"
    ))
    .bind(order_uid)
    .fetch_one(pool)
    .await
    .unwrap()
}

fn oversized_item(order: &mut Order) {
    order.items[0].size = "X".repeat(300);
}

#[sqlx::test(migrations = false)]
async fn test_init_is_idempotent(pool: PgPool) {
    let store = store(&pool).await;
    store.init().await.unwrap();

    let applied = DatabaseMigrations::get_applied_migrations(&pool).await.unwrap();
    assert_eq!(applied.len(), MIGRATIONS.len());
    assert!(DatabaseMigrations::run_all(pool.clone()).await.unwrap().is_empty());
}

#[sqlx::test(migrations = false)]
async fn test_concurrent_init_on_fresh_database(pool: PgPool) {
    let first = PostgresOrderStore::new(pool.clone(), IngestMetrics::disabled());
    let second = PostgresOrderStore::new(pool.clone(), IngestMetrics::disabled());

    let (a, b) = tokio::join!(first.init(), second.init());
    a.unwrap();
    b.unwrap();

    let applied = DatabaseMigrations::get_applied_migrations(&pool).await.unwrap();
    assert_eq!(applied.len(), MIGRATIONS.len());
}

#[sqlx::test(migrations = false)]
async fn test_budgets_cover_every_attempt(pool: PgPool) {
    let store = PostgresOrderStore::new(pool.clone(), IngestMetrics::disabled());
    let per_attempt = pool.options().get_acquire_timeout();

    assert!(store.write_budget() >= per_attempt * 5);
    assert!(store.read_budget() >= per_attempt * 3);
    assert!(store.write_budget() > store.read_budget());
}

#[sqlx::test(migrations = false)]
async fn test_save_and_get_round_trip(pool: PgPool) {
    let store = store(&pool).await;
    let order = generate_test_order(3);

    store.save_order(&order).await.unwrap();
    let fetched = store.get_order(&order.order_uid).await.unwrap();

    assert_eq!(fetched, order);
    assert_eq!(fetched.items.len(), 4);
}

#[sqlx::test(migrations = false)]
async fn test_short_uid_order_through_service(pool: PgPool) {
    let store = Arc::new(store(&pool).await);
    let service = OrderService::new(
        store.clone(),
        Arc::new(TtlOrderCache::new(Duration::from_secs(60))),
        ServiceSettings::default(),
    );

    let mut order = generate_test_order(1);
    order.order_uid = "b563feb7b2b84b6test".to_string();
    order.date_created = None;
    order.items.truncate(1);
    order.items[0].price = 453;

    service.process_order(order.clone()).await.unwrap();

    let stored = store.get_order("b563feb7b2b84b6test").await.unwrap();
    assert_eq!(stored.items[0].price, 453);
    assert!(stored.date_created.is_some());
    assert_eq!(stored.payment, order.payment);
    assert_eq!(stored.delivery, order.delivery);
    service.close().await;
}

#[sqlx::test(migrations = false)]
async fn test_resave_replaces_item_list(pool: PgPool) {
    let store = store(&pool).await;
    let mut order = generate_test_order(4);
    assert_eq!(order.items.len(), 5);
    store.save_order(&order).await.unwrap();

    order.items.truncate(2);
    order.items[1].price = 777;
    order.delivery.city = "Elsewhere".to_string();
    store.save_order(&order).await.unwrap();
    store.save_order(&order).await.unwrap();

    let fetched = store.get_order(&order.order_uid).await.unwrap();
    assert_eq!(fetched, order);
    assert_eq!(count(&pool, "items", &order.order_uid).await, 2);
    assert_eq!(count(&pool, "orders", &order.order_uid).await, 1);
}

#[sqlx::test(migrations = false)]
async fn test_failed_item_insert_rolls_back_new_order(pool: PgPool) {
    let store = store(&pool).await;
    let mut order = generate_test_order(5);
    oversized_item(&mut order);

    let err = store.save_order(&order).await.unwrap_err();
    assert!(matches!(err, IngestError::Database { .. }), "{err}");
    assert!(!err.is_retryable());

    for table in ["orders", "delivery", "payment", "items"] {
        assert_eq!(count(&pool, table, &order.order_uid).await, 0, "{table}");
    }
    assert!(store.get_order(&order.order_uid).await.unwrap_err().is_not_found());
}

#[sqlx::test(migrations = false)]
async fn test_failed_resave_keeps_previous_version(pool: PgPool) {
    let store = store(&pool).await;
    let original = generate_test_order(6);
    store.save_order(&original).await.unwrap();

    let mut update = original.clone();
    update.delivery.city = "Should Not Persist".to_string();
    update.items.truncate(1);
    oversized_item(&mut update);
    assert!(store.save_order(&update).await.is_err());

    let fetched = store.get_order(&original.order_uid).await.unwrap();
    assert_eq!(fetched, original);
}

#[sqlx::test(migrations = false)]
async fn test_missing_order_is_not_found(pool: PgPool) {
    let store = Arc::new(store(&pool).await);
    let service = OrderService::new(
        store.clone(),
        Arc::new(TtlOrderCache::new(Duration::from_secs(60))),
        ServiceSettings::default(),
    );

    let err = service.get_order("does-not-exist").await.unwrap_err();
    assert!(matches!(err, IngestError::OrderNotFound { .. }));
    assert_eq!(service.get_cache_stats().cache_size, 0);
    service.close().await;
}

#[sqlx::test(migrations = false)]
async fn test_get_all_newest_first_and_warm_up(pool: PgPool) {
    let store = Arc::new(store(&pool).await);
    for index in 1..=100 {
        store.save_order(&generate_test_order(index)).await.unwrap();
    }

    let all = store.get_all_orders().await.unwrap();
    assert_eq!(all.len(), 100);
    assert_eq!(all[0], generate_test_order(100));
    assert_eq!(all[99], generate_test_order(1));

    let service = OrderService::new(
        store.clone(),
        Arc::new(TtlOrderCache::new(Duration::from_secs(60))),
        ServiceSettings::default(),
    );
    assert_eq!(service.warm_up_cache().await.unwrap(), 100);
    assert_eq!(service.cache().size(), 100);
    service.close().await;
}
