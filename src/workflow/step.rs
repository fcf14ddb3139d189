//! Step definitions: the executable nodes of a workflow DAG.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::dispatch::RetryPolicy;
use crate::types::{AgentRole, StepId};

/// Outputs produced so far in a session, keyed by the step that produced
/// them. Checkpoints persist exactly this map.
pub type StepOutputs = FxHashMap<StepId, Value>;

/// Everything a step's input builder may draw from.
///
/// `dataset` is the payload handed to `submit`; `outputs` holds ancestor
/// step outputs; `user_input` carries the most recent `provide_input`
/// payload when the step is being re-entered after a suspension.
#[derive(Debug, Clone)]
pub struct StepInputs<'a> {
    pub dataset: &'a Value,
    pub outputs: &'a StepOutputs,
    pub user_input: Option<&'a Value>,
}

type InputBuilder = Arc<dyn Fn(&StepInputs<'_>) -> Value + Send + Sync>;

/// One node of a workflow DAG.
///
/// Steps are configuration, not code: the only behavior they carry is the
/// pure input builder mapping ancestor outputs to a request payload. The
/// worker that runs the step is selected purely by `role`.
#[derive(Clone)]
pub struct StepDefinition {
    pub id: StepId,
    pub role: AgentRole,
    /// Per-step timeout; `None` falls back to the configured role default.
    pub timeout: Option<Duration>,
    /// Retry policy applied by the dispatcher; `None` falls back to config.
    pub retry: Option<RetryPolicy>,
    /// Steps flagged suspendable may return `InputRequired`, pausing the
    /// whole workflow until `provide_input` arrives.
    pub suspendable: bool,
    /// Idempotent steps participate in dispatch deduplication.
    pub idempotent: bool,
    /// Marks the format-detection coordination step: its reply is a list of
    /// detector contributions that the core aggregates itself.
    pub is_detection: bool,
    /// Marks the validation step: its reply is a list of validator
    /// responses folded through the validation aggregator.
    pub is_validation: bool,
    /// Dependencies (parent step ids), sorted for determinism.
    pub dependencies: Vec<StepId>,
    input: InputBuilder,
}

impl StepDefinition {
    /// Create a step with defaults: no explicit timeout or retry override,
    /// not suspendable, idempotent, and an input builder that forwards the
    /// dataset reference plus all ancestor outputs.
    pub fn new(id: impl Into<StepId>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            role,
            timeout: None,
            retry: None,
            suspendable: false,
            idempotent: true,
            is_detection: false,
            is_validation: false,
            dependencies: Vec::new(),
            input: Arc::new(default_input),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Allow this step to pause the workflow with `InputRequired`.
    #[must_use]
    pub fn suspendable(mut self) -> Self {
        self.suspendable = true;
        self
    }

    /// Opt out of dispatch deduplication for side-effecting workers.
    #[must_use]
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    /// Mark as the format-detection coordination step.
    #[must_use]
    pub fn detection(mut self) -> Self {
        self.is_detection = true;
        self
    }

    /// Mark as the ensemble-validation step.
    #[must_use]
    pub fn validation(mut self) -> Self {
        self.is_validation = true;
        self
    }

    /// Declare dependencies on earlier steps.
    #[must_use]
    pub fn depends_on<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.dependencies.extend(parents.into_iter().map(Into::into));
        self.dependencies.sort();
        self.dependencies.dedup();
        self
    }

    /// Replace the input builder with a custom pure function.
    #[must_use]
    pub fn with_input<F>(mut self, builder: F) -> Self
    where
        F: Fn(&StepInputs<'_>) -> Value + Send + Sync + 'static,
    {
        self.input = Arc::new(builder);
        self
    }

    /// Build the request payload for this step from the session context.
    #[must_use]
    pub fn build_input(&self, inputs: &StepInputs<'_>) -> Value {
        (self.input)(inputs)
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("timeout", &self.timeout)
            .field("suspendable", &self.suspendable)
            .field("idempotent", &self.idempotent)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

fn default_input(inputs: &StepInputs<'_>) -> Value {
    let mut upstream = serde_json::Map::new();
    let mut keys: Vec<&StepId> = inputs.outputs.keys().collect();
    keys.sort();
    for key in keys {
        upstream.insert(key.as_str().to_string(), inputs.outputs[key].clone());
    }
    let mut payload = serde_json::Map::new();
    payload.insert("dataset".to_string(), inputs.dataset.clone());
    payload.insert("upstream".to_string(), Value::Object(upstream));
    if let Some(user) = inputs.user_input {
        payload.insert("user_input".to_string(), user.clone());
    }
    Value::Object(payload)
}
