mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use nwbflow::config::{ConfigHandle, OrchestratorConfig};
use nwbflow::dispatch::{
    AgentDispatcher, AgentReply, CircuitState, DispatchError, RetryPolicy,
};
use nwbflow::types::{AgentRole, CorrelationId, SessionId};
use nwbflow::workflow::StepDefinition;
use tokio_util::sync::CancellationToken;

use common::{Script, ScriptedPort};

fn dispatcher_with(port: Arc<ScriptedPort>, mutate: impl FnOnce(&mut OrchestratorConfig)) -> AgentDispatcher {
    let mut config = OrchestratorConfig::default();
    config.agent.timeout_default_ms = Duration::from_millis(200);
    config.agent.retry = RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::from_millis(5),
        cap: Duration::from_millis(20),
        jitter: 0.0,
    };
    mutate(&mut config);
    AgentDispatcher::new(port, ConfigHandle::new(config))
}

fn conversion_step(id: &str) -> StepDefinition {
    StepDefinition::new(id, AgentRole::Conversion).non_idempotent()
}

async fn one_dispatch(
    dispatcher: &AgentDispatcher,
    step: &StepDefinition,
    session: &SessionId,
) -> Result<AgentReply, DispatchError> {
    dispatcher
        .dispatch(
            step,
            json!({ "try": true }),
            session,
            &CorrelationId::generate(),
            &CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn circuit_opens_on_the_fifth_consecutive_failure_across_sessions() {
    let port = ScriptedPort::new();
    port.set_default("convert", Script::Retryable("worker sick".into()));
    let dispatcher = dispatcher_with(port.clone(), |c| {
        c.agent.circuit.failure_threshold = 5;
        c.agent.circuit.cooldown = Duration::from_millis(80);
    });
    let step = conversion_step("convert");

    let session_a = SessionId::new("session-a");
    let session_b = SessionId::new("session-b");
    for session in [&session_a, &session_a, &session_a, &session_b, &session_b] {
        let err = one_dispatch(&dispatcher, &step, session).await.unwrap_err();
        assert!(matches!(err, DispatchError::RetriesExhausted { .. }));
    }
    assert_eq!(port.calls("convert"), 5);
    assert_eq!(
        dispatcher.circuit_state(AgentRole::Conversion, "default"),
        CircuitState::Open
    );

    // Sixth dispatch short-circuits without touching the worker.
    let err = one_dispatch(&dispatcher, &step, &session_a).await.unwrap_err();
    assert!(matches!(err, DispatchError::CircuitOpen { .. }));
    assert_eq!(port.calls("convert"), 5);

    // After the cooldown a single probe is admitted; success closes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    port.set_default("convert", Script::Ok(json!({ "artifact": "out.nwb" })));
    let reply = one_dispatch(&dispatcher, &step, &session_a).await.unwrap();
    assert!(matches!(reply, AgentReply::Ok(_)));
    assert_eq!(
        dispatcher.circuit_state(AgentRole::Conversion, "default"),
        CircuitState::Closed
    );

    // Normal traffic flows again.
    let reply = one_dispatch(&dispatcher, &step, &session_b).await.unwrap();
    assert!(matches!(reply, AgentReply::Ok(_)));
}

#[tokio::test]
async fn retries_stop_at_the_configured_budget() {
    let port = ScriptedPort::new();
    port.set_default("convert", Script::Retryable("still busy".into()));
    let dispatcher = dispatcher_with(port.clone(), |c| {
        c.agent.retry.max_attempts = 4;
    });
    let step = conversion_step("convert");
    let session = SessionId::new("s1");

    let err = one_dispatch(&dispatcher, &step, &session).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::RetriesExhausted { attempts: 4, .. }
    ));
    assert_eq!(port.calls("convert"), 4);
    assert_eq!(
        dispatcher.attempts_for(&session, &step.id),
        4,
        "every attempt leaves an invocation record"
    );
}

#[tokio::test]
async fn permanent_failures_are_never_retried() {
    let port = ScriptedPort::new();
    port.set_default("convert", Script::Permanent("bad geometry".into()));
    let dispatcher = dispatcher_with(port.clone(), |c| {
        c.agent.retry.max_attempts = 5;
    });
    let step = conversion_step("convert");

    let err = one_dispatch(&dispatcher, &step, &SessionId::new("s1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Permanent { .. }));
    assert_eq!(port.calls("convert"), 1);
}

#[tokio::test]
async fn timeouts_cancel_the_port_and_count_as_attempts() {
    let port = ScriptedPort::new();
    port.set_default("convert", Script::Hang);
    let dispatcher = dispatcher_with(port.clone(), |c| {
        c.agent.retry.max_attempts = 2;
    });
    let step = StepDefinition::new("convert", AgentRole::Conversion)
        .non_idempotent()
        .with_timeout(Duration::from_millis(30));
    let session = SessionId::new("s1");

    let err = one_dispatch(&dispatcher, &step, &session).await.unwrap_err();
    assert!(matches!(err, DispatchError::Timeout { attempts: 2, .. }));
    assert_eq!(port.calls("convert"), 2);
}

#[tokio::test]
async fn idempotent_steps_deduplicate_on_the_request_key() {
    let port = ScriptedPort::new();
    port.set_default("convert", Script::Ok(json!({ "artifact": "out.nwb" })));
    let dispatcher = dispatcher_with(port.clone(), |_| {});
    let step = StepDefinition::new("convert", AgentRole::Conversion);
    let session = SessionId::new("s1");

    let first = one_dispatch(&dispatcher, &step, &session).await.unwrap();
    let second = one_dispatch(&dispatcher, &step, &session).await.unwrap();
    assert_eq!(port.calls("convert"), 1, "second call served from cache");
    match (first, second) {
        (AgentReply::Ok(a), AgentReply::Ok(b)) => assert_eq!(a, b),
        other => panic!("expected cached Ok replies, got {other:?}"),
    }

    // A different session never shares the cache.
    let _ = one_dispatch(&dispatcher, &step, &SessionId::new("s2"))
        .await
        .unwrap();
    assert_eq!(port.calls("convert"), 2);
}

#[tokio::test]
async fn cancellation_interrupts_between_attempts() {
    let port = ScriptedPort::new();
    port.set_default("convert", Script::Retryable("busy".into()));
    let dispatcher = dispatcher_with(port.clone(), |c| {
        c.agent.retry.max_attempts = 10;
        c.agent.retry.base_delay = Duration::from_millis(20);
    });
    let step = conversion_step("convert");
    let session = SessionId::new("s1");
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel_clone.cancel();
    });

    let err = dispatcher
        .dispatch(
            &step,
            json!({}),
            &session,
            &CorrelationId::generate(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled { .. }));
    assert!(port.calls("convert") < 10);
}
