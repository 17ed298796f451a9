use accel_ratelimit::config::RouteConfig;
use accel_ratelimit::rate_limit::{
    chunk_size_for_rate, BucketRegistry, BucketState, MemoryStore, RateSignal, SignalHeaders,
    TokenBucket,
};
use accel_ratelimit::router::Router;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::{HeaderMap, HeaderValue, Method};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    Runtime::new().expect("Failed to create runtime")
}

fn benchmark_bucket_allow(c: &mut Criterion) {
    let rt = runtime();
    let bucket = TokenBucket::with_state(
        "bench",
        u64::MAX / 2,
        1.0,
        None,
        BucketState::new(f64::MAX, SystemTime::now()),
    );

    c.bench_function("bucket_allow", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(bucket.allow(black_box(65_536)).await) })
    });
}

fn benchmark_registry_lookup(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("registry_get_or_create");

    for num_users in [1usize, 100, 10_000].iter() {
        let registry = BucketRegistry::new(Arc::new(MemoryStore::new()), 1.0);
        rt.block_on(async {
            for i in 0..*num_users {
                registry.get_or_create(&format!("user-{}", i), 1_048_576).await;
            }
        });

        group.bench_with_input(
            BenchmarkId::from_parameter(num_users),
            num_users,
            |b, &_num| {
                b.to_async(&rt)
                    .iter(|| async { black_box(registry.get_or_create("user-0", 1_048_576).await) })
            },
        );
    }
    group.finish();
}

fn benchmark_chunk_size(c: &mut Criterion) {
    c.bench_function("chunk_size_for_rate", |b| {
        b.iter(|| {
            for rate in [1_024u64, 11_000_000, 60_000_000] {
                black_box(chunk_size_for_rate(black_box(rate)));
            }
        })
    });
}

fn benchmark_signal_parsing(c: &mut Criterion) {
    let names = SignalHeaders::default();
    let mut headers = HeaderMap::new();
    headers.insert("x-accel-redirect", HeaderValue::from_static("/files/video.mp4"));
    headers.insert("x-accel-user-id", HeaderValue::from_static("user-42"));
    headers.insert("x-accel-ratelimit", HeaderValue::from_static("1048576"));

    c.bench_function("signal_parsing", |b| {
        b.iter(|| black_box(RateSignal::from_headers(black_box(&headers), &names)))
    });
}

fn benchmark_router_fallthrough(c: &mut Criterion) {
    let routes = (0..50)
        .map(|i| RouteConfig {
            path: format!("/api/service{}/*rest", i),
            backend: format!("http://localhost:{}", 3000 + i),
            methods: vec![],
            strip_prefix: false,
            description: format!("Service {}", i),
        })
        .collect();

    let router = Router::new(routes).expect("Failed to create router");

    c.bench_function("router_static_fallthrough", |b| {
        b.iter(|| black_box(router.match_route("/files/video.mp4", &Method::GET)))
    });
}

criterion_group!(
    benches,
    benchmark_bucket_allow,
    benchmark_registry_lookup,
    benchmark_chunk_size,
    benchmark_signal_parsing,
    benchmark_router_fallthrough
);
criterion_main!(benches);
