//! Canned workers and event-collection helpers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use nwbflow::engine::WorkflowEngine;
use nwbflow::event_bus::{SequencedEvent, SubscribeFrom, WorkflowEvent};
use nwbflow::session::SessionPhase;
use nwbflow::types::SessionId;

use super::agents::{Script, ScriptedPort};

/// Validator ensemble response: zero critical, two warnings.
pub fn two_warning_validators() -> Value {
    json!([{
        "validator": "nwb-inspector",
        "issues": [
            {
                "severity": "Warning",
                "rule": "check_subject_sex",
                "location": "/general/subject",
                "message": "subject sex not specified"
            },
            {
                "severity": "Warning",
                "rule": "check_session_description",
                "location": "/general",
                "message": "session description is generic"
            }
        ]
    }])
}

/// A port scripted for the scenario-1 happy path: confident SpikeGLX
/// detection, quiet metadata, a conversion artifact, two warnings.
pub fn happy_port() -> Arc<ScriptedPort> {
    let port = ScriptedPort::new();
    port.set_default(
        "detect-format",
        Script::Ok(json!([{
            "format": "SpikeGLX",
            "confidence": 0.97,
            "evidence": "found .ap.bin and .ap.meta pair"
        }])),
    );
    port.set_default("collect-metadata", Script::Ok(json!({ "metadata": { "species": "Mus musculus" } })));
    port.set_default("convert", Script::Ok(json!({ "artifact": "out.nwb" })));
    port.set_default("validate", Script::Ok(two_warning_validators()));
    // Standalone validations dispatch outside any workflow; a clean empty
    // ensemble response keeps them passing.
    port.set_default("validate-standalone", Script::Ok(json!([])));
    port
}

/// Poll `status` until the session reaches `phase` (or panic after 5 s).
pub async fn wait_for_phase(engine: &WorkflowEngine, id: &SessionId, phase: SessionPhase) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = engine.status(id).await.expect("status");
        if snapshot.phase == phase {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never reached {phase}; stuck in {}",
            snapshot.phase
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Replay everything from seq 0 and keep receiving until a terminal
/// `Completed` event (or a quiet period) is observed.
pub async fn collect_until_terminal(
    engine: &WorkflowEngine,
    id: &SessionId,
) -> Vec<SequencedEvent> {
    let mut subscription = engine
        .subscribe(id, SubscribeFrom::Seq(0))
        .await
        .expect("subscribe");
    let mut events = Vec::new();
    while let Some(Ok(event)) = subscription.next_timeout(Duration::from_secs(2)).await {
        let terminal = event.event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

/// The `to`-phases of all `StateChanged` events, in order.
pub fn state_changes(events: &[SequencedEvent]) -> Vec<SessionPhase> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            WorkflowEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}
