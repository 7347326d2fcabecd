use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hostel_gateway::{
    handler_fn, rate_limit::SlidingWindowLimiter, routes::RateLimitRule, routes::RouteRegistry,
    Gateway, GatewayConfig, GatewayRequest, ResponseCache, RouteOptions,
};
use http::Method;
use serde_json::json;
use std::time::{Duration, Instant};

fn benchmark_route_lookup(c: &mut Criterion) {
    let registry = RouteRegistry::default();
    for path in ["/vouchers", "/stays", "/orders", "/rooms", "/guests", "/invoices"] {
        for method in [Method::GET, Method::POST, Method::DELETE] {
            registry.register_route(
                method,
                path,
                handler_fn(|_req| async { Ok(json!(null)) }),
                RouteOptions::new(),
            );
        }
    }

    c.bench_function("route_lookup", |b| {
        b.iter(|| black_box(registry.get_route(&Method::POST, black_box("/orders"))))
    });
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    let limiter = SlidingWindowLimiter::new();
    let rule = RateLimitRule {
        max: 1_000,
        window: Duration::from_millis(10),
    };
    let start = Instant::now();
    let mut tick = 0u64;

    c.bench_function("rate_limit_check", |b| {
        b.iter(|| {
            // Advance a synthetic clock so the window keeps sliding
            tick += 1;
            let now = start + Duration::from_micros(tick);
            black_box(limiter.check_and_record("GET:/stays", "client-42", rule, now))
        })
    });

    c.bench_function("rate_limit_check_many_clients", |b| {
        let clients: Vec<String> = (0..256).map(|i| format!("client-{}", i)).collect();
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % clients.len();
            black_box(limiter.check_and_record("GET:/stays", &clients[i], rule, start))
        })
    });
}

fn benchmark_cache_key(c: &mut Criterion) {
    let query: Vec<(String, String)> = [
        ("to", "2024-06-12"),
        ("from", "2024-06-10"),
        ("guests", "2"),
        ("room", "dorm 6"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    c.bench_function("cache_key_canonical_query", |b| {
        b.iter(|| black_box(ResponseCache::cache_key("GET:/stays", black_box(&query))))
    });
}

fn benchmark_cached_dispatch(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build runtime");

    let mut config = GatewayConfig::default();
    config.rate_limiting.enabled = false;
    let gateway = Gateway::new(config).expect("failed to build gateway");
    gateway.register_route(
        Method::GET,
        "/stays",
        handler_fn(|_req| async { Ok(json!({"stays": []})) }),
        RouteOptions::new().cacheable(Duration::from_secs(3600)),
    );
    runtime.block_on(gateway.handle(GatewayRequest::get("/stays")));

    c.bench_function("dispatch_cache_hit", |b| {
        b.iter(|| black_box(runtime.block_on(gateway.handle(GatewayRequest::get("/stays")))))
    });
}

criterion_group!(
    benches,
    benchmark_route_lookup,
    benchmark_rate_limiter,
    benchmark_cache_key,
    benchmark_cached_dispatch
);
criterion_main!(benches);
