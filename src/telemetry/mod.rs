//! Tracing setup and compact event rendering.
//!
//! Diagnostics go to stderr so the stdio adapter's frame channel stays
//! clean. `RUST_LOG`-style filtering applies via the standard env filter.

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::event_bus::{SequencedEvent, WorkflowEvent};

/// Install the global tracing subscriber. Safe to call once per process;
/// later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .with(ErrorLayer::default())
        .try_init();
}

/// One-line human rendering of an event, used in adapter logs.
#[must_use]
pub fn render_event(event: &SequencedEvent) -> String {
    let body = match &event.event {
        WorkflowEvent::StateChanged { from, to } => match from {
            Some(from) => format!("state {from} -> {to}"),
            None => format!("state -> {to}"),
        },
        WorkflowEvent::StepStarted { step } => format!("step {step} started"),
        WorkflowEvent::StepProgress {
            step,
            fraction,
            message,
        } => format!("step {step} {:.0}%: {message}", fraction * 100.0),
        WorkflowEvent::StepCompleted { step } => format!("step {step} completed"),
        WorkflowEvent::InputRequired { step, schema } => {
            format!("step {step} awaiting input ({})", schema.id)
        }
        WorkflowEvent::ErrorRaised { kind, message, .. } => format!("error {kind}: {message}"),
        WorkflowEvent::Completed { summary } => format!("finished as {}", summary.outcome),
        WorkflowEvent::ConfigChanged { snapshot } => format!("config reloaded ({snapshot})"),
        WorkflowEvent::ProvenanceDegraded {
            consecutive_failures,
        } => format!("provenance degraded ({consecutive_failures} consecutive failures)"),
    };
    format!("[{}@{}] {}", event.session_id, event.seq, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionPhase;
    use crate::types::{SessionId, StepId};
    use chrono::Utc;

    #[test]
    fn renders_compact_lines() {
        let event = SequencedEvent {
            session_id: SessionId::new("s1"),
            seq: 3,
            at: Utc::now(),
            event: WorkflowEvent::StateChanged {
                from: Some(SessionPhase::Analyzing),
                to: SessionPhase::CollectingMetadata,
            },
        };
        assert_eq!(
            render_event(&event),
            "[s1@3] state Analyzing -> CollectingMetadata"
        );
    }
}
