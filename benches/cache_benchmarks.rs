use criterion::{black_box, criterion_group, criterion_main, Criterion};
use order_ingest::cache::TtlOrderCache;
use order_ingest::messaging::generate_test_order;
use order_ingest::services::OrderCache;
use order_ingest::validation::OrderValidator;
use order_ingest::Order;
use std::time::Duration;

fn seeded_cache(size: u64) -> (TtlOrderCache, Vec<Order>) {
    let cache = TtlOrderCache::new(Duration::from_secs(3600));
    let orders: Vec<Order> = (0..size).map(generate_test_order).collect();
    cache.load_from_slice(&orders);
    (cache, orders)
}

fn benchmark_cache_get(c: &mut Criterion) {
    let (cache, orders) = seeded_cache(1_000);
    let uid = orders[500].order_uid.clone();

    c.bench_function("cache_get_hit", |b| b.iter(|| cache.get(black_box(&uid))));
    c.bench_function("cache_get_miss", |b| {
        b.iter(|| cache.get(black_box("does-not-exist")))
    });
}

fn benchmark_cache_set(c: &mut Criterion) {
    let cache = TtlOrderCache::new(Duration::from_secs(3600));
    let order = generate_test_order(42);

    c.bench_function("cache_set", |b| b.iter(|| cache.set(black_box(order.clone()))));
}

fn benchmark_warm_up(c: &mut Criterion) {
    let orders: Vec<Order> = (0..1_000).map(generate_test_order).collect();

    c.bench_function("cache_load_1000", |b| {
        b.iter(|| {
            let cache = TtlOrderCache::new(Duration::from_secs(3600));
            cache.load_from_slice(black_box(&orders));
            cache.size()
        })
    });
}

fn benchmark_decode_and_validate(c: &mut Criterion) {
    let payload = generate_test_order(7).to_json_bytes().unwrap();
    let validator = OrderValidator::strict();

    c.bench_function("decode_and_validate", |b| {
        b.iter(|| {
            let order = Order::from_json_bytes(black_box(&payload)).unwrap();
            validator.validate(&order).is_ok()
        })
    });
}

criterion_group!(
    benches,
    benchmark_cache_get,
    benchmark_cache_set,
    benchmark_warm_up,
    benchmark_decode_and_validate
);
criterion_main!(benches);
