//! Benchmarks for the admission hot path
//!
//! This benchmark measures:
//! - Single-subject checks for both algorithms
//! - Checks spread across many subjects (map lookup + per-key lock)
//! - Closed breaker overhead around a trivial operation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resilience_kit::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use resilience_kit::resilience::rate_limiter::{RateLimitPolicy, RateLimiter, RateLimiterConfig};
use std::time::Duration;

fn policies() -> Vec<(&'static str, RateLimitPolicy)> {
    vec![
        ("token_bucket", RateLimitPolicy::token_bucket(1e9, 1e9)),
        (
            "sliding_window",
            RateLimitPolicy::sliding_window(1_000, Duration::from_millis(1)),
        ),
    ]
}

fn bench_single_subject(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_and_consume");
    group.throughput(Throughput::Elements(1));

    for (name, policy) in policies() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(policy));
        group.bench_with_input(BenchmarkId::new("single_subject", name), &limiter, |b, rl| {
            b.iter(|| black_box(rl.check_and_consume(black_box("subject"))))
        });
    }
    group.finish();
}

fn bench_many_subjects(c: &mut Criterion) {
    let mut group = c.benchmark_group("many_subjects");
    let keys: Vec<String> = (0..1_000).map(|i| format!("tenant-{}", i)).collect();

    for max_keys in [100usize, 10_000] {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new(RateLimitPolicy::token_bucket(1e9, 1e9)).with_max_keys(max_keys),
        );
        group.throughput(Throughput::Elements(keys.len() as u64));
        group.bench_with_input(BenchmarkId::new("max_keys", max_keys), &limiter, |b, rl| {
            b.iter(|| {
                for key in &keys {
                    black_box(rl.check_and_consume(key));
                }
            })
        });
    }
    group.finish();
}

fn bench_breaker_closed(c: &mut Criterion) {
    let breaker = CircuitBreaker::named("bench", CircuitBreakerConfig::default());
    c.bench_function("breaker_call_closed", |b| {
        b.iter(|| {
            let res = breaker.call(|| Ok::<_, ()>(black_box(42u64)));
            black_box(res.ok())
        })
    });

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    c.bench_function("breaker_execute_closed", |b| {
        b.to_async(&rt).iter(|| async {
            let res = breaker
                .execute(|| async { Ok::<_, ()>(black_box(42u64)) })
                .await;
            black_box(res.ok())
        })
    });
}

criterion_group!(
    benches,
    bench_single_subject,
    bench_many_subjects,
    bench_breaker_closed
);
criterion_main!(benches);
