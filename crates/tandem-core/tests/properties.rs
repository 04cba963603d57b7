//! End-to-end behaviour of the bus through its public API.

use std::sync::Arc;
use std::time::Duration;
use tandem_core::{
    BusConfig, BusError, ConnectionMode, EventBus, EventDraft, EventFilter, SubscribeRequest,
    WaitRequest, WaitStatus,
};
use tandem_protocol::{Event, EventType, Frame};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn bus() -> EventBus {
    EventBus::new(BusConfig::default()).unwrap()
}

fn draft(target: &str, event_type: EventType) -> EventDraft {
    EventDraft::new(target, event_type, "test")
}

fn ids(events: &[Arc<Event>]) -> Vec<u64> {
    events.iter().map(|e| e.id).collect()
}

#[tokio::test]
async fn fast_path_returns_history_without_blocking() {
    let bus = bus();
    bus.publish(draft("note", EventType::Create)).unwrap();
    bus.publish(draft("note", EventType::Update)).unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        bus.wait_for_updates(
            WaitRequest::new("agent").with_filter(EventFilter::new().since(0)),
            &CancellationToken::new(),
        ),
    )
    .await
    .expect("fast path must not block")
    .unwrap();

    assert_eq!(outcome.status, WaitStatus::Updates);
    assert_eq!(ids(&outcome.events), vec![1, 2]);
    assert_eq!(outcome.next_cursor, 2);
    assert_eq!(outcome.summary.unwrap().total, 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_after_deadline() {
    let bus = bus();
    bus.publish(draft("note", EventType::Create)).unwrap();

    let started = Instant::now();
    let outcome = bus
        .wait_for_updates(
            WaitRequest::new("agent")
                .with_filter(EventFilter::new().since(bus.latest_id()))
                .with_timeout(Duration::from_secs(1)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, WaitStatus::Timeout);
    assert!(outcome.events.is_empty());
    assert_eq!(started.elapsed(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn successive_waits_never_repeat_events() {
    let bus = bus();
    let token = CancellationToken::new();
    let mut seen = Vec::new();

    for round in 0..4 {
        for _ in 0..=round {
            bus.publish(draft("task", EventType::Update)).unwrap();
        }
        // Explicitly asking for everything still honours the cursor.
        let outcome = bus
            .wait_for_updates(
                WaitRequest::new("agent")
                    .with_filter(EventFilter::new().since(0))
                    .with_timeout(Duration::from_secs(1)),
                &token,
            )
            .await
            .unwrap();
        seen.extend(ids(&outcome.events));
    }

    let expected: Vec<u64> = (1..=10).collect();
    assert_eq!(seen, expected);

    let outcome = bus
        .wait_for_updates(
            WaitRequest::new("agent").with_timeout(Duration::from_secs(1)),
            &token,
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, WaitStatus::Timeout);
}

#[tokio::test(start_paused = true)]
async fn events_published_while_suspended_are_coalesced() {
    let bus = bus();
    let waiter = {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.wait_for_updates(WaitRequest::new("agent"), &CancellationToken::new())
                .await
        })
    };
    tokio::task::yield_now().await;

    for _ in 0..3 {
        bus.publish(draft("note", EventType::Update)).unwrap();
    }

    let outcome = waiter.await.unwrap().unwrap();
    assert_eq!(ids(&outcome.events), vec![1, 2, 3]);
}

#[test]
fn publish_rate_limit() {
    let bus = EventBus::new(BusConfig {
        rate_limit_events_per_minute: 0,
        rate_limit_burst: Some(5),
        ..BusConfig::default()
    })
    .unwrap();
    bus.register("producer", ConnectionMode::Pull, ["*"]).unwrap();

    for _ in 0..5 {
        bus.publish(draft("note", EventType::Create).with_origin("producer"))
            .unwrap();
    }
    assert_eq!(
        bus.publish(draft("note", EventType::Create).with_origin("producer"))
            .unwrap_err(),
        BusError::RateLimited("producer".into())
    );
    assert_eq!(bus.metrics().rate_limit_hits, 1);

    // Unregistered producers have no bucket.
    assert!(bus.publish(draft("note", EventType::Create).with_origin("someone")).is_ok());
}

#[test]
fn history_bound_evicts_oldest() {
    let bus = EventBus::new(BusConfig {
        max_event_history: 20,
        ..BusConfig::default()
    })
    .unwrap();
    for _ in 0..30 {
        bus.publish(draft("note", EventType::Create)).unwrap();
    }

    let history = bus.history(&EventFilter::new());
    assert_eq!(history.len(), 20);
    assert_eq!(history.first().unwrap().id, 11);
    assert_eq!(history.last().unwrap().id, 30);
}

#[tokio::test]
async fn pattern_routing_to_push_subscribers() {
    let bus = bus();
    let (tx, mut frames) = mpsc::unbounded_channel();
    bus.subscribe(SubscribeRequest::new("ui", ["note:*"]), Recorder(tx))
        .unwrap();

    bus.publish(draft("note", EventType::Create)).unwrap();
    bus.publish(draft("task", EventType::Create)).unwrap();
    bus.publish(draft("note", EventType::Conflict)).unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        if let Frame::Event { event } = frames.recv().await.unwrap() {
            received.push((event.id, event.target));
        }
    }
    assert_eq!(received, vec![(1, "note".to_string()), (3, "note".to_string())]);
}

#[tokio::test]
async fn overlapping_patterns_deliver_once() {
    let bus = bus();
    let (tx, mut frames) = mpsc::unbounded_channel();
    bus.subscribe(
        SubscribeRequest::new("ui", ["note:*", "*:create", "*"]),
        Recorder(tx),
    )
    .unwrap();
    bus.publish(draft("note", EventType::Create)).unwrap();
    bus.publish(draft("task", EventType::Delete)).unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        if let Frame::Event { event } = frames.recv().await.unwrap() {
            received.push(event.id);
        }
    }
    assert_eq!(received, vec![1, 2]);
    assert!(frames.try_recv().is_err());
}

#[test]
fn unregister_is_idempotent() {
    let bus = bus();
    bus.register("agent", ConnectionMode::Pull, ["*"]).unwrap();
    bus.unregister("agent");
    bus.unregister("agent");
    bus.unregister("never-seen");
    assert!(bus.connections().is_empty());
}

#[test]
fn capacity_limit() {
    let bus = EventBus::new(BusConfig {
        max_connections: 1,
        ..BusConfig::default()
    })
    .unwrap();
    bus.register("a", ConnectionMode::Pull, ["*"]).unwrap();
    assert_eq!(
        bus.register("b", ConnectionMode::Pull, ["*"]).unwrap_err(),
        BusError::Capacity(1)
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_leaves_cursor_unchanged() {
    let bus = bus();
    bus.publish(draft("note", EventType::Create)).unwrap();
    bus.wait_for_updates(WaitRequest::new("agent"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(bus.cursor("agent"), Some(1));

    let token = CancellationToken::new();
    let waiter = {
        let bus = bus.clone();
        let token = token.clone();
        tokio::spawn(async move {
            bus.wait_for_updates(
                WaitRequest::new("agent").with_timeout(Duration::from_secs(30)),
                &token,
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();

    let outcome = waiter.await.unwrap().unwrap();
    assert_eq!(outcome.status, WaitStatus::Cancelled);
    assert!(outcome.events.is_empty());
    assert_eq!(outcome.next_cursor, 1);
    assert_eq!(bus.cursor("agent"), Some(1));
}

#[tokio::test]
async fn invalid_pattern_rejected() {
    let bus = bus();
    let (tx, _frames) = mpsc::unbounded_channel();
    assert!(matches!(
        bus.subscribe(SubscribeRequest::new("ui", ["note:explode"]), Recorder(tx)),
        Err(BusError::InvalidPattern { .. })
    ));
}

struct Recorder(mpsc::UnboundedSender<Frame>);

#[async_trait::async_trait]
impl tandem_core::PushSink for Recorder {
    async fn send(&mut self, frame: &Frame) -> Result<(), tandem_core::DeliveryError> {
        self.0
            .send(frame.clone())
            .map_err(|_| tandem_core::DeliveryError::Closed)
    }
}
