//! Error taxonomy for the orchestration core.
//!
//! Every failure the core can produce maps to a stable [`ErrorKind`] tag
//! that is carried on the wire by all three transport adapters, plus a
//! retryability flag consumed by the dispatcher and by HTTP status mapping.
//!
//! Propagation policy: only `Internal`, `Unauthorized`, `NotFound`,
//! `InvalidStateTransition`/`TerminalState`, `NotSuspended`,
//! `InputSchemaMismatch`, and submit-time `InvalidWorkflow` surface as
//! synchronous operation failures. All other kinds manifest as session
//! events and state transitions while the triggering operation still
//! acknowledges success.

use miette::Diagnostic;
use thiserror::Error;

use crate::session::SessionPhase;
use crate::types::{AgentRole, CorrelationId, SessionId, StepId};
use crate::workflow::WorkflowError;

/// Stable wire-level tag for an error category.
///
/// Kinds, not type names: adapters serialize these tags verbatim and the
/// shared contract tests assert that all three transports agree on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    InvalidWorkflow,
    Unauthorized,
    NotFound,
    InvalidStateTransition,
    TerminalState,
    NotSuspended,
    InputSchemaMismatch,
    ConcurrencyError,
    Timeout,
    CircuitOpen,
    AgentPermanentFailure,
    ValidationFailed,
    UserInputTimeout,
    ProvenanceDegraded,
    SubscriberOverflow,
    ValidatorUnavailable,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidWorkflow => "InvalidWorkflow",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidStateTransition => "InvalidStateTransition",
            ErrorKind::TerminalState => "TerminalState",
            ErrorKind::NotSuspended => "NotSuspended",
            ErrorKind::InputSchemaMismatch => "InputSchemaMismatch",
            ErrorKind::ConcurrencyError => "ConcurrencyError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::CircuitOpen => "CircuitOpen",
            ErrorKind::AgentPermanentFailure => "AgentPermanentFailure",
            ErrorKind::ValidationFailed => "ValidationFailed",
            ErrorKind::UserInputTimeout => "UserInputTimeout",
            ErrorKind::ProvenanceDegraded => "ProvenanceDegraded",
            ErrorKind::SubscriberOverflow => "SubscriberOverflow",
            ErrorKind::ValidatorUnavailable => "ValidatorUnavailable",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type returned by engine operations.
#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    /// The submitted workflow definition is structurally invalid.
    #[error(transparent)]
    #[diagnostic(code(nwbflow::errors::invalid_workflow))]
    InvalidWorkflow(#[from] WorkflowError),

    /// The referenced workflow name is not registered with this orchestrator.
    #[error("unknown workflow reference: {reference}")]
    #[diagnostic(
        code(nwbflow::errors::unknown_workflow),
        help("Workflows are registered at orchestrator startup; check the reference spelling.")
    )]
    UnknownWorkflow { reference: String },

    /// The principal lacks rights for the requested operation.
    #[error("principal {principal} is not authorized for this operation")]
    #[diagnostic(code(nwbflow::errors::unauthorized))]
    Unauthorized { principal: crate::types::Principal },

    /// Unknown session or resource.
    #[error("session not found: {session_id}")]
    #[diagnostic(code(nwbflow::errors::not_found))]
    NotFound { session_id: SessionId },

    /// An operation attempted a transition the state machine forbids.
    #[error("illegal state transition: {from} -> {to}")]
    #[diagnostic(
        code(nwbflow::errors::invalid_state_transition),
        help("Consult the session lifecycle table; the session was left unmodified.")
    )]
    InvalidStateTransition { from: SessionPhase, to: SessionPhase },

    /// The session has reached a terminal phase and accepts no mutation.
    #[error("session {session_id} is terminal ({phase}); operation rejected")]
    #[diagnostic(code(nwbflow::errors::terminal_state))]
    TerminalState {
        session_id: SessionId,
        phase: SessionPhase,
    },

    /// `provide_input` was called while no input prompt is outstanding.
    #[error("session {session_id} is not suspended awaiting input")]
    #[diagnostic(code(nwbflow::errors::not_suspended))]
    NotSuspended { session_id: SessionId },

    /// Provided input does not satisfy the pending prompt schema.
    #[error("input does not match the pending prompt schema: {detail}")]
    #[diagnostic(
        code(nwbflow::errors::input_schema_mismatch),
        help("Inspect the InputRequired event for the prompt field list.")
    )]
    InputSchemaMismatch { detail: String },

    /// Optimistic version check failed inside the store.
    ///
    /// Internal only: the per-session exclusive lock prevents user-visible
    /// occurrences; this surfacing would indicate a core defect.
    #[error("optimistic concurrency violation on {session_id}: expected v{expected}, found v{actual}")]
    #[diagnostic(code(nwbflow::errors::concurrency))]
    Concurrency {
        session_id: SessionId,
        expected: u64,
        actual: u64,
    },

    /// An agent or suspension deadline expired.
    #[error("deadline expired for {role} step {step}")]
    #[diagnostic(code(nwbflow::errors::timeout))]
    Timeout { role: AgentRole, step: StepId },

    /// The dispatcher short-circuited because the target breaker is open.
    #[error("circuit open for role {role} instance {instance}")]
    #[diagnostic(
        code(nwbflow::errors::circuit_open),
        help("The worker is known-bad; dispatches resume after the cooldown probe succeeds.")
    )]
    CircuitOpen { role: AgentRole, instance: String },

    /// A worker declared the failure non-retryable.
    #[error("agent {role} failed permanently: {message}")]
    #[diagnostic(code(nwbflow::errors::agent_permanent))]
    AgentPermanentFailure {
        role: AgentRole,
        message: String,
        fix_hint: Option<String>,
    },

    /// No validator in the requested set could be dispatched.
    #[error("validator set unavailable: {detail}")]
    #[diagnostic(code(nwbflow::errors::validator_unavailable))]
    ValidatorUnavailable { detail: String },

    /// A subscriber could not keep up with critical events and was detached.
    #[error("event subscriber overflowed for session {session_id}")]
    #[diagnostic(code(nwbflow::errors::subscriber_overflow))]
    SubscriberOverflow { session_id: SessionId },

    /// Storage port failure.
    #[error(transparent)]
    #[diagnostic(code(nwbflow::errors::storage))]
    Storage(#[from] crate::storage::StorageError),

    /// Unexpected failure; logged with full context, surfaced opaquely.
    #[error("internal error (correlation {correlation}): {message}")]
    #[diagnostic(
        code(nwbflow::errors::internal),
        help("Retrieve server logs by correlation id for the full context.")
    )]
    Internal {
        correlation: CorrelationId,
        message: String,
    },
}

impl OrchestratorError {
    /// Wire-level category for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::InvalidWorkflow(_) | OrchestratorError::UnknownWorkflow { .. } => {
                ErrorKind::InvalidWorkflow
            }
            OrchestratorError::Unauthorized { .. } => ErrorKind::Unauthorized,
            OrchestratorError::NotFound { .. } => ErrorKind::NotFound,
            OrchestratorError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            OrchestratorError::TerminalState { .. } => ErrorKind::TerminalState,
            OrchestratorError::NotSuspended { .. } => ErrorKind::NotSuspended,
            OrchestratorError::InputSchemaMismatch { .. } => ErrorKind::InputSchemaMismatch,
            OrchestratorError::Concurrency { .. } => ErrorKind::ConcurrencyError,
            OrchestratorError::Timeout { .. } => ErrorKind::Timeout,
            OrchestratorError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            OrchestratorError::AgentPermanentFailure { .. } => ErrorKind::AgentPermanentFailure,
            OrchestratorError::ValidatorUnavailable { .. } => ErrorKind::ValidatorUnavailable,
            OrchestratorError::SubscriberOverflow { .. } => ErrorKind::SubscriberOverflow,
            OrchestratorError::Storage(_) => ErrorKind::Internal,
            OrchestratorError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether a caller may reasonably retry the same operation later.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::CircuitOpen | ErrorKind::ValidatorUnavailable
        )
    }
}
