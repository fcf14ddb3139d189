//! Session lifecycle: the checkpointed state machine at the heart of the
//! orchestrator.
//!
//! A [`Session`] is one end-to-end conversion attempt. Its [`SessionPhase`]
//! walks a fixed lifecycle validated against a precomputed adjacency table;
//! an illegal transition raises `InvalidStateTransition` and leaves the
//! session untouched. Once a terminal phase (Completed, Failed, Cancelled)
//! is reached, no further mutation is accepted.
//!
//! ```text
//! Analyzing
//!   |- step success      -> CollectingMetadata
//!   |- InputRequired     -> Suspended (returns to CollectingMetadata)
//!   `- fatal error       -> Failed
//! CollectingMetadata
//!   |- metadata ready    -> Converting
//!   |- InputRequired     -> Suspended
//! Converting -> Validating -> Completed
//!            |             `- validation fail -> CollectingMetadata
//!            |                (until the auto-fix budget is exhausted)
//!            `- fatal -> Failed
//! Any non-terminal --cancel--> Cancelled
//! ```
//!
//! Versions increase strictly on every persisted mutation; checkpoints
//! reference the version at which they were taken (handle semantics, no
//! back-pointer object graphs).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::errors::{ErrorKind, OrchestratorError};
use crate::types::{AgentRole, CorrelationId, Principal, SessionId, StepId};

/// Lifecycle phase of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Detecting the source format and planning the conversion.
    Analyzing,
    /// Gathering metadata, possibly interactively.
    CollectingMetadata,
    /// The conversion worker is producing the output artifact.
    Converting,
    /// Validators are inspecting the produced artifact.
    Validating,
    /// Paused awaiting `provide_input`; resumes to a recorded phase.
    Suspended,
    /// Terminal: the conversion finished and was validated.
    Completed,
    /// Terminal: an unrecoverable error ended the session.
    Failed,
    /// Terminal: cooperative cancellation completed.
    Cancelled,
}

impl SessionPhase {
    /// Terminal phases accept no further mutation.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Completed | SessionPhase::Failed | SessionPhase::Cancelled
        )
    }

    /// The phase a step of `role` executes under.
    #[must_use]
    pub fn for_role(role: AgentRole) -> SessionPhase {
        match role {
            AgentRole::Conversation | AgentRole::Internal => SessionPhase::Analyzing,
            AgentRole::MetadataQuestioner => SessionPhase::CollectingMetadata,
            AgentRole::Conversion => SessionPhase::Converting,
            AgentRole::Evaluation => SessionPhase::Validating,
        }
    }

    /// Legal successor phases, from the precomputed adjacency table.
    ///
    /// `Failed -> CollectingMetadata/...` rows exist solely for the
    /// retryable-resume path; ordinary mutation is still rejected by the
    /// terminal guard in [`Session::transition`].
    #[must_use]
    pub fn legal_transitions(&self) -> &'static [SessionPhase] {
        use SessionPhase::*;
        match self {
            Analyzing => &[CollectingMetadata, Suspended, Failed, Cancelled],
            CollectingMetadata => &[Converting, Suspended, Failed, Cancelled],
            Converting => &[Validating, Suspended, Failed, Cancelled],
            Validating => &[Completed, CollectingMetadata, Failed, Cancelled],
            Suspended => &[
                Analyzing,
                CollectingMetadata,
                Converting,
                Validating,
                Failed,
                Cancelled,
            ],
            Completed => &[],
            Failed => &[Analyzing, CollectingMetadata, Converting, Validating],
            Cancelled => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(&self, to: SessionPhase) -> bool {
        self.legal_transitions().contains(&to)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Analyzing => "Analyzing",
            SessionPhase::CollectingMetadata => "CollectingMetadata",
            SessionPhase::Converting => "Converting",
            SessionPhase::Validating => "Validating",
            SessionPhase::Suspended => "Suspended",
            SessionPhase::Completed => "Completed",
            SessionPhase::Failed => "Failed",
            SessionPhase::Cancelled => "Cancelled",
        };
        f.write_str(label)
    }
}

/// One field of an input prompt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptField {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
    /// When present, the supplied value must be one of these strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

/// Schema of the input a suspended step is waiting for.
///
/// Deliberately small: a named list of fields, each optionally constrained
/// to an enumerated choice set. Rich schema languages live with the workers;
/// the core only needs enough structure to reject malformed answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptSchema {
    pub id: String,
    pub title: String,
    pub fields: Vec<PromptField>,
}

impl PromptSchema {
    /// Check `input` against this schema.
    ///
    /// Returns the list of violations, empty when the input is acceptable.
    #[must_use]
    pub fn violations(&self, input: &Value) -> Vec<String> {
        let mut problems = Vec::new();
        let Some(object) = input.as_object() else {
            return vec!["input must be a JSON object".to_string()];
        };
        for field in &self.fields {
            match object.get(&field.name) {
                None if field.required => {
                    problems.push(format!("missing required field `{}`", field.name));
                }
                None => {}
                Some(value) => {
                    if let Some(choices) = &field.choices {
                        let matches = value
                            .as_str()
                            .map(|s| choices.iter().any(|c| c == s))
                            .unwrap_or(false);
                        if !matches {
                            problems.push(format!(
                                "field `{}` must be one of {:?}",
                                field.name, choices
                            ));
                        }
                    }
                }
            }
        }
        problems
    }
}

/// Bookkeeping for an outstanding `InputRequired`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingInput {
    /// The step that raised the prompt and will be re-entered.
    pub step: StepId,
    pub schema: PromptSchema,
    pub requested_at: DateTime<Utc>,
    /// Suspension deadline; expiry fails the session with UserInputTimeout.
    pub deadline: DateTime<Utc>,
    /// Phase to transition back into once input arrives.
    pub resume_to: SessionPhase,
}

/// Structured record embedded in a session when it fails.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub step: Option<StepId>,
    pub role: Option<AgentRole>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
    pub correlation: CorrelationId,
    /// Whether `resume` may re-enter execution from the last checkpoint.
    pub retryable: bool,
}

/// The top-level unit of orchestration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub principal: Principal,
    /// Name of the registered workflow definition driving this session.
    pub workflow: String,
    pub phase: SessionPhase,
    /// Monotone counter, incremented by the store on every persist.
    pub version: u64,
    /// Versions at which checkpoints were appended, oldest first.
    pub checkpoint_versions: Vec<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: FxHashMap<String, Value>,
    pub error: Option<ErrorRecord>,
    pub pending_input: Option<PendingInput>,
    /// Dataset payload supplied to `submit`.
    pub dataset: Value,
    /// Latest `provide_input` payload awaiting consumption by the pending
    /// step, cleared once the step consumes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input: Option<Value>,
    /// Correlation id spanning the whole session.
    pub correlation: CorrelationId,
    /// Configuration snapshot id captured at creation.
    pub config_snapshot: String,
    /// Remaining validation auto-fix loops before a Fail verdict is final.
    pub auto_fix_remaining: u32,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        principal: Principal,
        workflow: impl Into<String>,
        dataset: Value,
        expire_after: std::time::Duration,
        config_snapshot: impl Into<String>,
        auto_fix_budget: u32,
    ) -> Self {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(expire_after)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        Self {
            id: SessionId::generate(),
            principal,
            workflow: workflow.into(),
            phase: SessionPhase::Analyzing,
            version: 0,
            checkpoint_versions: Vec::new(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            metadata: FxHashMap::default(),
            error: None,
            pending_input: None,
            dataset,
            user_input: None,
            correlation: CorrelationId::generate(),
            config_snapshot: config_snapshot.into(),
            auto_fix_remaining: auto_fix_budget,
        }
    }

    /// Move to `to`, validating against the adjacency table.
    ///
    /// Terminal phases reject every transition with `TerminalState`; a
    /// non-adjacent target raises `InvalidStateTransition`. The session is
    /// only mutated when the transition is legal.
    pub fn transition(&mut self, to: SessionPhase) -> Result<(), OrchestratorError> {
        if self.phase.is_terminal() {
            return Err(OrchestratorError::TerminalState {
                session_id: self.id.clone(),
                phase: self.phase,
            });
        }
        if !self.phase.can_transition_to(to) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Re-open a retryably failed session onto `to` for resume.
    ///
    /// This is the single sanctioned exception to terminal immutability;
    /// it requires an error record explicitly marked retryable.
    pub fn reopen(&mut self, to: SessionPhase) -> Result<(), OrchestratorError> {
        let retryable = self
            .error
            .as_ref()
            .map(|e| e.retryable)
            .unwrap_or(false);
        if self.phase != SessionPhase::Failed || !retryable {
            return Err(OrchestratorError::TerminalState {
                session_id: self.id.clone(),
                phase: self.phase,
            });
        }
        if !self.phase.can_transition_to(to) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        self.error = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Read-only view returned by the `status` operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub phase: SessionPhase,
    pub version: u64,
    pub current_step: Option<StepId>,
    /// Fraction of steps with recorded outputs, in [0, 1].
    pub completion: f64,
    /// Latest event sequence number published for this session.
    pub latest_seq: u64,
    pub error: Option<ErrorRecord>,
    pub updated_at: DateTime<Utc>,
}

/// Compact per-session row for `list_sessions`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub principal: Principal,
    pub workflow: String,
    pub phase: SessionPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            principal: session.principal.clone(),
            workflow: session.workflow.clone(),
            phase: session.phase,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> Session {
        Session::new(
            Principal::new("alice"),
            "standard-conversion",
            json!({"path": "/data/rec"}),
            std::time::Duration::from_secs(3600),
            "cfg-1",
            1,
        )
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        let mut s = session();
        for phase in [
            SessionPhase::CollectingMetadata,
            SessionPhase::Converting,
            SessionPhase::Validating,
            SessionPhase::Completed,
        ] {
            s.transition(phase).unwrap();
        }
        assert!(s.phase.is_terminal());
    }

    #[test]
    fn illegal_transition_does_not_mutate() {
        let mut s = session();
        let err = s.transition(SessionPhase::Validating).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidStateTransition { .. }
        ));
        assert_eq!(s.phase, SessionPhase::Analyzing);
    }

    #[test]
    fn terminal_phase_rejects_everything() {
        let mut s = session();
        s.transition(SessionPhase::Cancelled).unwrap();
        let err = s.transition(SessionPhase::Analyzing).unwrap_err();
        assert!(matches!(err, OrchestratorError::TerminalState { .. }));
    }

    #[test]
    fn validation_fail_recovery_loops_back_to_metadata() {
        let mut s = session();
        s.transition(SessionPhase::CollectingMetadata).unwrap();
        s.transition(SessionPhase::Converting).unwrap();
        s.transition(SessionPhase::Validating).unwrap();
        s.transition(SessionPhase::CollectingMetadata).unwrap();
        assert_eq!(s.phase, SessionPhase::CollectingMetadata);
    }

    #[test]
    fn reopen_requires_retryable_error() {
        let mut s = session();
        s.transition(SessionPhase::Failed).unwrap();
        assert!(s.reopen(SessionPhase::Converting).is_err());

        let mut s = session();
        s.error = Some(ErrorRecord {
            kind: ErrorKind::Timeout,
            step: Some(StepId::new("convert")),
            role: Some(AgentRole::Conversion),
            message: "deadline expired".into(),
            fix_hint: None,
            correlation: CorrelationId::generate(),
            retryable: true,
        });
        s.transition(SessionPhase::Failed).unwrap();
        s.reopen(SessionPhase::Converting).unwrap();
        assert_eq!(s.phase, SessionPhase::Converting);
        assert!(s.error.is_none());
    }

    #[test]
    fn prompt_schema_rejects_missing_and_out_of_set_values() {
        let schema = PromptSchema {
            id: "disambiguate-format".into(),
            title: "Choose a format".into(),
            fields: vec![PromptField {
                name: "format".into(),
                description: String::new(),
                required: true,
                choices: Some(vec!["SpikeGLX".into(), "OpenEphys".into()]),
            }],
        };

        assert!(schema.violations(&json!({"format": "SpikeGLX"})).is_empty());
        assert_eq!(schema.violations(&json!({})).len(), 1);
        assert_eq!(schema.violations(&json!({"format": "Nonsense"})).len(), 1);
        assert_eq!(schema.violations(&json!("not an object")).len(), 1);
    }
}
