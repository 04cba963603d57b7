//! Sustained in-process throughput of the event bus.
//!
//! Producers publish as fast as they can while push streams and long-poll
//! consumers drain. Reports published and delivered events per second.
//!
//! ```bash
//! bus_throughput [producers] [push_streams] [pull_consumers]
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_bench::{bench_bus, draft, CountingSink};
use tandem_core::{EventBus, SubscribeRequest, WaitRequest, WaitStatus};
use tandem_protocol::EventType;
use tokio_util::sync::CancellationToken;

const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<usize> = std::env::args()
        .skip(1)
        .filter_map(|s| s.parse().ok())
        .collect();
    let producers = args.first().copied().unwrap_or(4);
    let push_streams = args.get(1).copied().unwrap_or(16);
    let pull_consumers = args.get(2).copied().unwrap_or(16);

    println!("Tandem bus throughput");
    println!(
        "  producers: {producers}, push streams: {push_streams}, pull consumers: {pull_consumers}"
    );
    println!("  warmup: {WARMUP_SECS}s, measurement: {BENCH_SECS}s");
    println!();

    let bus = bench_bus(push_streams + pull_consumers + 1);
    let sink = CountingSink::default();
    for i in 0..push_streams {
        bus.subscribe(SubscribeRequest::new(format!("ui-{i}"), ["*"]), sink.clone())
            .expect("subscribe");
    }

    let pulled = Arc::new(AtomicU64::new(0));
    let stop = CancellationToken::new();
    let mut consumers = Vec::new();
    for i in 0..pull_consumers {
        consumers.push(tokio::spawn(run_consumer(
            bus.clone(),
            format!("agent-{i}"),
            Arc::clone(&pulled),
            stop.clone(),
        )));
    }

    let published = Arc::new(AtomicU64::new(0));
    let running = Arc::new(AtomicBool::new(true));
    let mut producer_tasks = Vec::new();
    for _ in 0..producers {
        producer_tasks.push(tokio::spawn(run_producer(
            bus.clone(),
            Arc::clone(&published),
            Arc::clone(&running),
        )));
    }

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;
    published.store(0, Ordering::SeqCst);
    pulled.store(0, Ordering::SeqCst);
    sink.reset();
    let start = Instant::now();

    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed().as_secs_f64();
    let published = published.load(Ordering::SeqCst);
    let pushed = sink.events();
    let pulled = pulled.load(Ordering::SeqCst);

    running.store(false, Ordering::SeqCst);
    stop.cancel();
    for task in producer_tasks.into_iter().chain(consumers) {
        let _ = task.await;
    }
    let metrics = bus.metrics();
    bus.shutdown().await;

    println!("Results over {elapsed:.2}s");
    println!("  published:        {:>12.0} events/s", published as f64 / elapsed);
    println!("  pushed:           {:>12.0} events/s", pushed as f64 / elapsed);
    println!("  pulled:           {:>12.0} events/s", pulled as f64 / elapsed);
    println!("  failed deliveries: {:>11}", metrics.failed_deliveries);
    println!("  rate limit hits:   {:>11}", metrics.rate_limit_hits);
}

async fn run_producer(bus: EventBus, published: Arc<AtomicU64>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        if bus.publish(draft("note", EventType::Update)).is_ok() {
            published.fetch_add(1, Ordering::Relaxed);
        }
        tokio::task::yield_now().await;
    }
}

async fn run_consumer(bus: EventBus, id: String, pulled: Arc<AtomicU64>, stop: CancellationToken) {
    loop {
        let request = WaitRequest::new(id.as_str()).with_timeout(Duration::from_secs(1));
        match bus.wait_for_updates(request, &stop).await {
            Ok(outcome) if outcome.status == WaitStatus::Updates => {
                pulled.fetch_add(outcome.events.len() as u64, Ordering::Relaxed);
            }
            Ok(outcome) if outcome.status == WaitStatus::Cancelled => return,
            Ok(_) => {}
            Err(e) => {
                eprintln!("consumer {id} failed: {e}");
                return;
            }
        }
    }
}
