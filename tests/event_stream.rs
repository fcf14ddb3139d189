mod common;

use std::time::Duration;

use nwbflow::config::{ConfigHandle, OrchestratorConfig};
use nwbflow::engine::{WorkflowEngineBuilder, STANDARD_WORKFLOW};
use nwbflow::event_bus::{
    EventBus, SubscribeFrom, SubscriptionEnd, WorkflowEvent,
};
use nwbflow::session::SessionPhase;
use nwbflow::types::{Principal, SessionId, StepId};

use common::{happy_port, wait_for_phase};

fn bus_with_buffer(buffer: usize) -> EventBus {
    let mut config = OrchestratorConfig::default();
    config.events.subscriber_buffer = buffer;
    EventBus::new(ConfigHandle::new(config))
}

fn progress(step: &str, i: usize) -> WorkflowEvent {
    WorkflowEvent::StepProgress {
        step: StepId::new(step),
        fraction: i as f64 / 10.0,
        message: format!("tick {i}"),
    }
}

fn state(to: SessionPhase) -> WorkflowEvent {
    WorkflowEvent::StateChanged { from: None, to }
}

#[tokio::test]
async fn replay_from_zero_matches_live_observation_for_critical_events() {
    let engine = WorkflowEngineBuilder::new(happy_port()).build();
    let id = engine
        .submit(
            STANDARD_WORKFLOW,
            serde_json::json!({ "path": "/data/x" }),
            Principal::new("lab-7"),
        )
        .await
        .unwrap();

    // Live subscriber attached right after submit.
    let mut live = engine.subscribe(&id, SubscribeFrom::Seq(0)).await.unwrap();
    wait_for_phase(&engine, &id, SessionPhase::Completed).await;

    let mut observed = Vec::new();
    while let Some(Ok(event)) = live.next_timeout(Duration::from_secs(1)).await {
        let terminal = event.event.is_terminal();
        observed.push(event);
        if terminal {
            break;
        }
    }

    let replayed = engine.events(&id, 0).await.unwrap();
    let critical_labels = |events: &[nwbflow::event_bus::SequencedEvent]| -> Vec<(u64, String)> {
        events
            .iter()
            .filter(|e| !e.event.is_lossy())
            .map(|e| (e.seq, e.event.label().to_string()))
            .collect()
    };
    assert_eq!(critical_labels(&observed), critical_labels(&replayed));
}

#[tokio::test]
async fn sequence_numbers_are_strictly_increasing_per_subscriber() {
    let engine = WorkflowEngineBuilder::new(happy_port()).build();
    let id = engine
        .submit(
            STANDARD_WORKFLOW,
            serde_json::json!({}),
            Principal::new("lab-7"),
        )
        .await
        .unwrap();
    let mut subscription = engine.subscribe(&id, SubscribeFrom::Seq(0)).await.unwrap();
    wait_for_phase(&engine, &id, SessionPhase::Completed).await;

    let mut last = 0;
    while let Some(Ok(event)) = subscription.next_timeout(Duration::from_millis(500)).await {
        assert!(event.seq > last, "seq {} not after {}", event.seq, last);
        last = event.seq;
        if event.event.is_terminal() {
            break;
        }
    }
    assert!(last > 0);
}

#[tokio::test]
async fn slow_subscribers_shed_lossy_events_but_keep_critical_ones() {
    let bus = bus_with_buffer(3);
    let id = SessionId::new("s1");
    bus.ensure_session(&id);
    let mut subscription = bus.subscribe(&id, SubscribeFrom::Latest).unwrap();

    // One critical event surrounded by a burst of lossy progress.
    bus.publish(&id, state(SessionPhase::Analyzing));
    for i in 0..20 {
        bus.publish(&id, progress("convert", i));
    }

    let mut received = Vec::new();
    while let Some(event) = subscription.try_recv() {
        received.push(event);
    }
    assert!(received.iter().any(|e| !e.event.is_lossy()));
    assert!(received.len() <= 3);
    assert!(bus.dropped_lossy() >= 17);
}

#[tokio::test]
async fn critical_overflow_detaches_only_the_slow_subscriber() {
    let bus = bus_with_buffer(2);
    let id = SessionId::new("s1");
    bus.ensure_session(&id);

    let mut slow = bus.subscribe(&id, SubscribeFrom::Latest).unwrap();

    // Three critical events against a buffer of two: the third cannot be
    // delivered and the subscriber is detached.
    bus.publish(&id, state(SessionPhase::Analyzing));
    bus.publish(&id, state(SessionPhase::CollectingMetadata));
    bus.publish(&id, state(SessionPhase::Converting));

    // A fresh subscriber still sees the full retained log.
    let mut fresh = bus.subscribe(&id, SubscribeFrom::Seq(0)).unwrap();

    // The slow subscriber drains its backlog, then learns it overflowed.
    assert!(slow.recv().await.is_ok());
    assert!(slow.recv().await.is_ok());
    match slow.recv().await {
        Err(SubscriptionEnd::Overflowed) => {}
        other => panic!("expected overflow, got {other:?}"),
    }

    let mut fresh_count = 0;
    while let Some(event) = fresh.try_recv() {
        assert!(!event.event.is_lossy());
        fresh_count += 1;
    }
    assert_eq!(fresh_count, 3);
}

#[tokio::test]
async fn latest_subscription_skips_history() {
    let bus = bus_with_buffer(16);
    let id = SessionId::new("s1");
    bus.ensure_session(&id);
    bus.publish(&id, state(SessionPhase::Analyzing));
    bus.publish(&id, state(SessionPhase::CollectingMetadata));

    let mut live_only = bus.subscribe(&id, SubscribeFrom::Latest).unwrap();
    assert!(live_only.try_recv().is_none());

    bus.publish(&id, state(SessionPhase::Converting));
    let event = live_only.recv().await.unwrap();
    assert_eq!(event.seq, 3);
}

#[tokio::test]
async fn purge_closes_subscriptions_gracefully() {
    let bus = bus_with_buffer(4);
    let id = SessionId::new("s1");
    bus.ensure_session(&id);
    let mut subscription = bus.subscribe(&id, SubscribeFrom::Latest).unwrap();

    bus.purge_session(&id);
    match subscription.recv().await {
        Err(SubscriptionEnd::Closed) => {}
        other => panic!("expected graceful close, got {other:?}"),
    }
}
