// ABOUTME: Integration tests for the event bus request/response bridge.
// ABOUTME: Roundtrips, deadline/cancel cleanup, FIFO ordering, and resolution races on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use tether_core::bus::EventBus;
use tether_core::error::{PublishError, WorkerError};
use tether_core::protocol::{EventEnvelope, RegisterRequest, ResponseEnvelope, ResponsePayload};
use tether_core::registry::Registry;

fn make_bus() -> Arc<EventBus> {
    make_bus_with(Duration::from_secs(45), Duration::from_secs(180))
}

fn make_bus_with(heartbeat_timeout: Duration, stale_timeout: Duration) -> Arc<EventBus> {
    let registry = Arc::new(Registry::new(heartbeat_timeout, stale_timeout));
    Arc::new(EventBus::new(registry))
}

fn register(bus: &EventBus, id: &str, capabilities: &[&str]) {
    bus.register_worker(RegisterRequest {
        id: Some(id.to_string()),
        version: None,
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        max_concurrency: 1,
        labels: Default::default(),
    });
}

fn event(platform: &str, event_type: &str, text: &str) -> EventEnvelope {
    let mut data = Map::new();
    data.insert("text".to_string(), Value::String(text.to_string()));
    EventEnvelope::new(None, platform, event_type, data)
}

fn response(correlation_id: &str, text: &str) -> ResponseEnvelope {
    let mut body = Map::new();
    body.insert("text".to_string(), Value::String(text.to_string()));
    ResponseEnvelope::new(
        correlation_id,
        ResponsePayload {
            platform: "slack".to_string(),
            response_url: None,
            body,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_publish_poll_respond_roundtrip() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let ev = event("slack", "message", "hello");
    let correlation_id = ev.id.clone();

    let publisher = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            bus.publish(ev, Duration::from_secs(2), CancellationToken::new())
                .await
        })
    };

    let events = bus.poll("w1", Duration::from_millis(500)).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, correlation_id);
    assert_eq!(events[0].payload.data["text"], json!("hello"));
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 1);

    bus.respond("w1", response(&correlation_id, "ok"));

    let payload = publisher.await.unwrap().unwrap();
    assert_eq!(payload.body["text"], json!("ok"));
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 0);
    assert_eq!(bus.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_publish_times_out_and_frees_pending_entry() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let ev = event("slack", "message", "nobody home");
    let correlation_id = ev.id.clone();

    let start = tokio::time::Instant::now();
    let err = bus
        .publish(ev, Duration::from_millis(200), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Timeout { .. }));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(300));
    assert!(!bus.has_pending(&correlation_id));
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 0);
}

#[tokio::test]
async fn test_publish_with_no_worker_fails_fast() {
    let bus = make_bus();
    let err = bus
        .publish(
            event("slack", "message", "hi"),
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, PublishError::NoEligibleWorker { ref capability } if capability == "slack.message")
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_cleans_up() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let token = CancellationToken::new();
    let publisher = {
        let bus = Arc::clone(&bus);
        let token = token.clone();
        tokio::spawn(async move {
            bus.publish(event("slack", "message", "hi"), Duration::from_secs(30), token)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(bus.pending_count(), 1);
    token.cancel();

    let err = publisher.await.unwrap().unwrap_err();
    assert!(matches!(err, PublishError::Cancelled));
    assert_eq!(bus.pending_count(), 0);
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_publisher_settles_pending_entry() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let publisher = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            bus.publish(
                event("slack", "message", "hi"),
                Duration::from_secs(30),
                CancellationToken::new(),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(bus.pending_count(), 1);

    publisher.abort();
    let _ = publisher.await;

    assert_eq!(bus.pending_count(), 0);
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_fifo_order_per_worker() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let e1 = event("slack", "message", "first");
    let e2 = event("slack", "message", "second");
    let e3 = event("slack", "message", "third");
    let ids = [e1.id.clone(), e2.id.clone(), e3.id.clone()];
    bus.publish_forget(e1).unwrap();
    bus.publish_forget(e2).unwrap();
    bus.publish_forget(e3).unwrap();

    let events = bus.poll("w1", Duration::from_millis(100)).await.unwrap();
    let got: Vec<_> = events.iter().map(|e| e.id.clone()).collect();
    assert_eq!(got, ids);
}

#[tokio::test(start_paused = true)]
async fn test_events_never_cross_capability_boundaries() {
    let bus = make_bus();
    register(&bus, "a", &["slack.message"]);
    register(&bus, "b", &["telegram.command"]);

    bus.publish_forget(event("telegram", "command", "go")).unwrap();

    let a_events = bus.poll("a", Duration::from_millis(50)).await.unwrap();
    assert!(a_events.is_empty());
    let b_events = bus.poll("b", Duration::from_millis(50)).await.unwrap();
    assert_eq!(b_events.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_poll_times_out_without_error() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let start = tokio::time::Instant::now();
    let events = bus.poll("w1", Duration::from_millis(100)).await.unwrap();
    assert!(events.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_poll_unknown_worker_rejected() {
    let bus = make_bus();
    let err = bus
        .poll("ghost", Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::NotRegistered(_)));
}

#[tokio::test]
async fn test_orphan_respond_is_a_noop() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);
    // Never panics, never touches inflight.
    bus.respond("w1", response("never-existed", "late"));
    bus.respond("w1", response("never-existed", "late again"));
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_double_respond_decrements_inflight_once() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let ev = event("slack", "message", "hi");
    let correlation_id = ev.id.clone();
    let publisher = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            bus.publish(ev, Duration::from_secs(2), CancellationToken::new())
                .await
        })
    };
    bus.poll("w1", Duration::from_millis(100)).await.unwrap();

    bus.respond("w1", response(&correlation_id, "ok"));
    bus.respond("w1", response(&correlation_id, "ok again"));

    assert!(publisher.await.unwrap().is_ok());
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_respond_after_timeout_is_orphan() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let ev = event("slack", "message", "hi");
    let correlation_id = ev.id.clone();
    let publisher = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            bus.publish(ev, Duration::from_millis(100), CancellationToken::new())
                .await
        })
    };
    bus.poll("w1", Duration::from_millis(50)).await.unwrap();

    let err = publisher.await.unwrap().unwrap_err();
    assert!(matches!(err, PublishError::Timeout { .. }));

    bus.respond("w1", response(&correlation_id, "too late"));
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 0);
    assert_eq!(bus.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_responders_exactly_one_wins() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let ev = event("slack", "message", "hi");
    let correlation_id = ev.id.clone();
    let publisher = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            bus.publish(ev, Duration::from_secs(5), CancellationToken::new())
                .await
        })
    };
    bus.poll("w1", Duration::from_millis(100)).await.unwrap();
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 1);

    let mut racers = Vec::new();
    for n in 0..8 {
        let bus = Arc::clone(&bus);
        let id = correlation_id.clone();
        racers.push(tokio::spawn(async move {
            bus.respond("w1", response(&id, &format!("racer-{}", n)));
        }));
    }
    for racer in racers {
        racer.await.unwrap();
    }

    assert!(publisher.await.unwrap().is_ok());
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 0);
    assert_eq!(bus.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_respond_from_non_owning_worker_ignored() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let ev = event("slack", "message", "hi");
    let correlation_id = ev.id.clone();
    let publisher = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            bus.publish(ev, Duration::from_secs(2), CancellationToken::new())
                .await
        })
    };
    bus.poll("w1", Duration::from_millis(100)).await.unwrap();

    // A different worker cannot resolve w1's request.
    bus.respond("imposter", response(&correlation_id, "spoofed"));
    assert_eq!(bus.pending_count(), 1);
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 1);

    bus.respond("w1", response(&correlation_id, "legit"));
    let payload = publisher.await.unwrap().unwrap();
    assert_eq!(payload.body["text"], json!("legit"));
}

#[tokio::test(start_paused = true)]
async fn test_reregistration_fails_pending_and_drops_queue() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let publisher = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            bus.publish(
                event("slack", "message", "hi"),
                Duration::from_secs(30),
                CancellationToken::new(),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(bus.pending_count(), 1);

    // Worker restarts and re-registers: pending work fails immediately,
    // and the superseded queue's events are gone.
    register(&bus, "w1", &["slack.message"]);

    let err = publisher.await.unwrap().unwrap_err();
    assert!(matches!(err, PublishError::WorkerReplaced { .. }));
    assert_eq!(bus.registry().get("w1").unwrap().inflight, 0);

    let events = bus.poll("w1", Duration::from_millis(50)).await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_fails_pending_for_offline_worker() {
    let bus = make_bus_with(Duration::from_secs(1), Duration::from_secs(2));
    let t0 = Utc::now();
    bus.register_worker_at(
        RegisterRequest {
            id: Some("w1".to_string()),
            version: None,
            capabilities: vec!["slack.message".to_string()],
            max_concurrency: 1,
            labels: Default::default(),
        },
        t0,
    );

    let publisher = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            bus.publish(
                event("slack", "message", "hi"),
                Duration::from_secs(30),
                CancellationToken::new(),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let outcome = bus.sweep_at(t0 + chrono::Duration::seconds(3));
    assert_eq!(outcome.removed, vec!["w1".to_string()]);

    let err = publisher.await.unwrap().unwrap_err();
    assert!(matches!(err, PublishError::WorkerGone { .. }));
    assert!(bus.registry().get("w1").is_none());
    assert!(matches!(
        bus.poll("w1", Duration::from_millis(10)).await,
        Err(WorkerError::NotRegistered(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_correlation_id_rejected() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);

    let ev = event("slack", "message", "hi");
    let dup = ev.clone();

    let publisher = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            bus.publish(ev, Duration::from_secs(5), CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = bus
        .publish(dup, Duration::from_secs(5), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::DuplicateCorrelationId(_)));

    publisher.abort();
    let _ = publisher.await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_returns_immediately_when_events_queued() {
    let bus = make_bus();
    register(&bus, "w1", &["slack.message"]);
    bus.publish_forget(event("slack", "message", "queued")).unwrap();

    let start = tokio::time::Instant::now();
    let events = bus.poll("w1", Duration::from_secs(25)).await.unwrap();
    assert_eq!(events.len(), 1);
    // Returned with queued work, not after the poll window.
    assert!(start.elapsed() < Duration::from_secs(1));
}
