//! Typed workflow events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::session::{ErrorRecord, PromptSchema, SessionPhase};
use crate::types::{SessionId, StepId};
use crate::validation::ValidationStatus;

/// Delivery class: critical events are never dropped for a live
/// subscriber, lossy ones may be shed under backpressure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventClass {
    Critical,
    Lossy,
}

/// Severity attached to `ErrorRaised` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Warning,
    Error,
    Fatal,
}

/// Terminal summary carried by the `Completed` event.
///
/// Failed sessions embed the structured error record (failing step, last
/// role, worker message, fix hint, correlation id); completed ones carry
/// the validation verdict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub outcome: SessionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<ValidationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

/// The event union emitted on the per-session log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkflowEvent {
    /// Phase transition; `from` is absent for the initial event.
    StateChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<SessionPhase>,
        to: SessionPhase,
    },
    StepStarted {
        step: StepId,
    },
    /// Fractional progress inside a step. Lossy under backpressure.
    StepProgress {
        step: StepId,
        fraction: f64,
        message: String,
    },
    StepCompleted {
        step: StepId,
    },
    /// The workflow paused awaiting user input matching `schema`.
    InputRequired {
        step: StepId,
        schema: PromptSchema,
    },
    ErrorRaised {
        kind: ErrorKind,
        severity: EventSeverity,
        recoverable: bool,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<StepId>,
    },
    /// Terminal event; retained past log eviction until session purge.
    Completed {
        summary: CompletionSummary,
    },
    /// Configuration hot reload took effect.
    ConfigChanged {
        snapshot: String,
    },
    /// Provenance recording is failing; the workflow continues (or not)
    /// per policy.
    ProvenanceDegraded {
        consecutive_failures: u32,
    },
}

impl WorkflowEvent {
    #[must_use]
    pub fn class(&self) -> EventClass {
        match self {
            WorkflowEvent::StepProgress { .. } => EventClass::Lossy,
            _ => EventClass::Critical,
        }
    }

    #[must_use]
    pub fn is_lossy(&self) -> bool {
        self.class() == EventClass::Lossy
    }

    /// `true` for events pinned in the log past retention eviction.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowEvent::Completed { .. })
    }

    /// Stable wire label, shared by all three transports.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            WorkflowEvent::StateChanged { .. } => "StateChanged",
            WorkflowEvent::StepStarted { .. } => "StepStarted",
            WorkflowEvent::StepProgress { .. } => "StepProgress",
            WorkflowEvent::StepCompleted { .. } => "StepCompleted",
            WorkflowEvent::InputRequired { .. } => "InputRequired",
            WorkflowEvent::ErrorRaised { .. } => "ErrorRaised",
            WorkflowEvent::Completed { .. } => "Completed",
            WorkflowEvent::ConfigChanged { .. } => "ConfigChanged",
            WorkflowEvent::ProvenanceDegraded { .. } => "ProvenanceDegraded",
        }
    }
}

/// An event stamped with its per-session sequence number.
///
/// Sequence numbers are monotone and gapless at publication; a subscriber
/// observing a gap knows only lossy events were shed in between.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub session_id: SessionId,
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: WorkflowEvent,
}
