//! Delivery latency benchmarks.
//!
//! Time from publish until a consumer holds the event, for a suspended
//! long-poll and for a push stream.

use criterion::{criterion_group, criterion_main, Criterion};
use std::time::{Duration, Instant};
use tandem_bench::{bench_bus, draft, CountingSink};
use tandem_core::{EventFilter, SubscribeRequest, WaitRequest};
use tandem_protocol::EventType;
use tokio_util::sync::CancellationToken;

/// Benchmark waking a suspended long-poll.
fn bench_wait_wakeup(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("wait_wakeup");

    group.bench_function("single_waiter", |b| {
        b.iter_custom(|iters| {
            runtime.block_on(async {
                let bus = bench_bus(1);
                let token = CancellationToken::new();
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let waiter = {
                        let bus = bus.clone();
                        let token = token.clone();
                        tokio::spawn(async move {
                            let outcome = bus
                                .wait_for_updates(
                                    WaitRequest::new("agent").with_timeout(Duration::from_secs(5)),
                                    &token,
                                )
                                .await;
                            (Instant::now(), outcome)
                        })
                    };
                    // Let the waiter suspend before publishing.
                    tokio::task::yield_now().await;

                    let published = Instant::now();
                    bus.publish(draft("note", EventType::Update)).unwrap();
                    let (woke, _) = waiter.await.unwrap();
                    total += woke.saturating_duration_since(published);
                }
                total
            })
        });
    });

    group.bench_function("fast_path", |b| {
        let bus = bench_bus(1);
        for _ in 0..100 {
            bus.publish(draft("note", EventType::Create)).unwrap();
        }
        let token = CancellationToken::new();
        b.iter(|| {
            // A fresh registration each time so the cursor does not hide the batch.
            bus.unregister("reader");
            runtime.block_on(bus.wait_for_updates(
                WaitRequest::new("reader").with_filter(EventFilter::new().since(90)),
                &token,
            ))
        });
    });

    group.finish();
}

/// Benchmark publish-to-delivery on a push stream.
fn bench_push_delivery(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("push_delivery");

    group.bench_function("single_stream", |b| {
        b.iter_custom(|iters| {
            runtime.block_on(async {
                let bus = bench_bus(1);
                let sink = CountingSink::default();
                bus.subscribe(SubscribeRequest::new("ui", ["*"]), sink.clone())
                    .unwrap();

                let start = Instant::now();
                for i in 1..=iters {
                    bus.publish(draft("task", EventType::Update)).unwrap();
                    while sink.events() < i {
                        tokio::task::yield_now().await;
                    }
                }
                let elapsed = start.elapsed();
                bus.shutdown().await;
                elapsed
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_wait_wakeup, bench_push_delivery);
criterion_main!(benches);
