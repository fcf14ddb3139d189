//! The dispatcher: timeout, retry, breaker, dedup, and audit plumbing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::ConfigHandle;
use crate::types::{AgentRole, CorrelationId, InvocationId, SessionId, SpanId, StepId};
use crate::workflow::StepDefinition;

use super::circuit::{Admission, CircuitBreaker};
use super::{AgentPort, AgentReply, AgentRequest};

/// Terminal outcome of one dispatch attempt, recorded immutably.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationOutcome {
    Ok,
    InputRequired,
    Timeout,
    RetryableFailure { reason: String },
    PermanentFailure { reason: String },
    Cancelled,
}

/// Immutable audit record of a single worker invocation attempt.
///
/// Retries produce a fresh record with an incremented attempt number
/// referencing the same step; completed records are never mutated.
#[derive(Clone, Debug)]
pub struct InvocationRecord {
    pub id: InvocationId,
    pub session_id: SessionId,
    pub step_id: StepId,
    pub role: AgentRole,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: InvocationOutcome,
    pub correlation: CorrelationId,
    pub span: SpanId,
}

/// Failures the dispatcher reports to the engine.
#[derive(Debug, Error, Diagnostic)]
pub enum DispatchError {
    /// The destination breaker is open; no worker call was made.
    #[error("circuit open for {role} instance {instance}")]
    #[diagnostic(code(nwbflow::dispatch::circuit_open))]
    CircuitOpen { role: AgentRole, instance: String },

    /// Every allowed attempt timed out or failed transiently.
    #[error("step {step} exhausted {attempts} attempts against {role}: {last_error}")]
    #[diagnostic(
        code(nwbflow::dispatch::retries_exhausted),
        help("Transient worker failures persisted beyond the retry budget.")
    )]
    RetriesExhausted {
        role: AgentRole,
        step: StepId,
        attempts: u32,
        last_error: String,
    },

    /// The final attempt expired; earlier ones may have failed transiently.
    #[error("step {step} timed out against {role} after {attempts} attempts")]
    #[diagnostic(code(nwbflow::dispatch::timeout))]
    Timeout {
        role: AgentRole,
        step: StepId,
        attempts: u32,
    },

    /// The worker declared the failure non-retryable.
    #[error("step {step} failed permanently against {role}: {message}")]
    #[diagnostic(code(nwbflow::dispatch::permanent))]
    Permanent {
        role: AgentRole,
        step: StepId,
        message: String,
        fix_hint: Option<String>,
    },

    /// Cooperative cancellation interrupted the dispatch.
    #[error("dispatch of step {step} to {role} was cancelled")]
    #[diagnostic(code(nwbflow::dispatch::cancelled))]
    Cancelled { role: AgentRole, step: StepId },
}

impl DispatchError {
    /// Whether a later `resume` may retry the owning step.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::CircuitOpen { .. }
                | DispatchError::RetriesExhausted { .. }
                | DispatchError::Timeout { .. }
        )
    }
}

/// Uniform resilience wrapper around the worker fleet.
///
/// One dispatcher serves every session; per-role concurrency caps are
/// enforced here so the engine's scheduler can stay simple. Concurrency
/// caps are fixed at construction; timeout, retry, and breaker tuning
/// follow the live configuration snapshot.
pub struct AgentDispatcher {
    port: Arc<dyn AgentPort>,
    config: ConfigHandle,
    breakers: Mutex<FxHashMap<(AgentRole, String), CircuitBreaker>>,
    role_permits: FxHashMap<AgentRole, Arc<Semaphore>>,
    dedup: Mutex<FxHashMap<String, Value>>,
    invocations: RwLock<FxHashMap<SessionId, Vec<InvocationRecord>>>,
}

impl AgentDispatcher {
    #[must_use]
    pub fn new(port: Arc<dyn AgentPort>, config: ConfigHandle) -> Self {
        let per_role = config.current().engine.max_concurrent_per_role.max(1);
        let role_permits = AgentRole::ALL
            .into_iter()
            .map(|role| (role, Arc::new(Semaphore::new(per_role))))
            .collect();
        Self {
            port,
            config,
            breakers: Mutex::new(FxHashMap::default()),
            role_permits,
            dedup: Mutex::new(FxHashMap::default()),
            invocations: RwLock::new(FxHashMap::default()),
        }
    }

    /// Dispatch one step with full resilience semantics.
    ///
    /// Returns the worker's `Ok` or `InputRequired` reply; every failure
    /// mode maps to a [`DispatchError`]. Attempt records are appended to
    /// the per-session invocation log regardless of outcome.
    #[instrument(skip(self, step, payload, cancel), fields(step = %step.id, role = %step.role), err)]
    pub async fn dispatch(
        &self,
        step: &StepDefinition,
        payload: Value,
        session_id: &SessionId,
        correlation: &CorrelationId,
        cancel: &CancellationToken,
    ) -> Result<AgentReply, DispatchError> {
        let cfg = self.config.current();
        let timeout = step
            .timeout
            .unwrap_or_else(|| cfg.agent.timeout_for(step.role));
        let retry = step.retry.unwrap_or(cfg.agent.retry);
        let instance = self.port.instance_id(step.role);

        let dedup_key = step
            .idempotent
            .then(|| request_key(session_id, &step.id, &payload));
        if let Some(key) = &dedup_key {
            if let Some(cached) = self.dedup.lock().get(key).cloned() {
                return Ok(AgentReply::Ok(cached));
            }
        }

        let _permit = self
            .role_permits
            .get(&step.role)
            .expect("all roles have permits")
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::Cancelled {
                role: step.role,
                step: step.id.clone(),
            })?;

        let max_attempts = retry.max_attempts.max(1);
        let mut last_transient = String::new();
        let mut timed_out_last = false;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                self.record(session_id, &step.id, step.role, attempt, Utc::now(), InvocationOutcome::Cancelled, correlation, SpanId::generate());
                return Err(DispatchError::Cancelled {
                    role: step.role,
                    step: step.id.clone(),
                });
            }

            match self.admit(step.role, &instance) {
                Admission::Rejected => {
                    return Err(DispatchError::CircuitOpen {
                        role: step.role,
                        instance,
                    });
                }
                Admission::Admitted | Admission::Probe => {}
            }

            let span = SpanId::generate();
            let request = AgentRequest {
                session_id: session_id.clone(),
                step_id: step.id.clone(),
                role: step.role,
                attempt,
                payload: payload.clone(),
                correlation: correlation.clone(),
                span: span.clone(),
            };
            let started_at = Utc::now();
            let attempt_cancel = cancel.child_token();
            let invoke = self
                .port
                .invoke(request, timeout, attempt_cancel.clone());

            let outcome = tokio::time::timeout(timeout, invoke).await;
            match outcome {
                Err(_elapsed) => {
                    attempt_cancel.cancel();
                    self.note_failure(step.role, &instance);
                    self.record(session_id, &step.id, step.role, attempt, started_at, InvocationOutcome::Timeout, correlation, span.clone());
                    timed_out_last = true;
                    last_transient = "deadline expired".to_string();
                }
                Ok(Ok(AgentReply::Ok(value))) => {
                    self.note_success(step.role, &instance);
                    self.record(session_id, &step.id, step.role, attempt, started_at, InvocationOutcome::Ok, correlation, span.clone());
                    if let Some(key) = dedup_key {
                        self.dedup.lock().insert(key, value.clone());
                    }
                    return Ok(AgentReply::Ok(value));
                }
                Ok(Ok(reply @ AgentReply::InputRequired { .. })) => {
                    self.note_success(step.role, &instance);
                    self.record(session_id, &step.id, step.role, attempt, started_at, InvocationOutcome::InputRequired, correlation, span.clone());
                    return Ok(reply);
                }
                Ok(Ok(AgentReply::RetryableFailure { reason })) => {
                    self.note_failure(step.role, &instance);
                    self.record(session_id, &step.id, step.role, attempt, started_at, InvocationOutcome::RetryableFailure { reason: reason.clone() }, correlation, span.clone());
                    timed_out_last = false;
                    last_transient = reason;
                }
                Ok(Ok(AgentReply::PermanentFailure { reason, fix_hint })) => {
                    self.note_failure(step.role, &instance);
                    self.record(session_id, &step.id, step.role, attempt, started_at, InvocationOutcome::PermanentFailure { reason: reason.clone() }, correlation, span.clone());
                    return Err(DispatchError::Permanent {
                        role: step.role,
                        step: step.id.clone(),
                        message: reason,
                        fix_hint,
                    });
                }
                Ok(Err(err)) if err.retryable => {
                    self.note_failure(step.role, &instance);
                    self.record(session_id, &step.id, step.role, attempt, started_at, InvocationOutcome::RetryableFailure { reason: err.message.clone() }, correlation, span.clone());
                    timed_out_last = false;
                    last_transient = err.message;
                }
                Ok(Err(err)) => {
                    self.note_failure(step.role, &instance);
                    self.record(session_id, &step.id, step.role, attempt, started_at, InvocationOutcome::PermanentFailure { reason: err.message.clone() }, correlation, span.clone());
                    return Err(DispatchError::Permanent {
                        role: step.role,
                        step: step.id.clone(),
                        message: err.message,
                        fix_hint: err.fix_hint,
                    });
                }
            }

            if attempt < max_attempts {
                let delay = retry.delay_after(attempt, &mut rand::rng());
                tokio::time::sleep(delay).await;
            }
        }

        if timed_out_last {
            Err(DispatchError::Timeout {
                role: step.role,
                step: step.id.clone(),
                attempts: max_attempts,
            })
        } else {
            Err(DispatchError::RetriesExhausted {
                role: step.role,
                step: step.id.clone(),
                attempts: max_attempts,
                last_error: last_transient,
            })
        }
    }

    /// Immutable invocation log for a session, oldest first.
    #[must_use]
    pub fn invocations_for(&self, session_id: &SessionId) -> Vec<InvocationRecord> {
        self.invocations
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Attempt count for one (session, step) pair.
    #[must_use]
    pub fn attempts_for(&self, session_id: &SessionId, step_id: &StepId) -> u32 {
        self.invocations
            .read()
            .get(session_id)
            .map(|log| log.iter().filter(|r| &r.step_id == step_id).count() as u32)
            .unwrap_or(0)
    }

    /// Drop audit state for a purged session.
    pub fn forget_session(&self, session_id: &SessionId) {
        self.invocations.write().remove(session_id);
        let prefix = format!("{session_id}\u{1f}");
        self.dedup.lock().retain(|key, _| !key.starts_with(&prefix));
    }

    /// Worker instance currently serving a role (provenance attribution).
    #[must_use]
    pub fn instance_for(&self, role: AgentRole) -> String {
        self.port.instance_id(role)
    }

    /// Current breaker state for a destination (observability and tests).
    #[must_use]
    pub fn circuit_state(&self, role: AgentRole, instance: &str) -> super::CircuitState {
        let mut breakers = self.breakers.lock();
        breakers
            .entry((role, instance.to_string()))
            .or_insert_with(|| CircuitBreaker::new(self.config.current().agent.circuit))
            .state()
    }

    fn admit(&self, role: AgentRole, instance: &str) -> Admission {
        let mut breakers = self.breakers.lock();
        breakers
            .entry((role, instance.to_string()))
            .or_insert_with(|| CircuitBreaker::new(self.config.current().agent.circuit))
            .try_admit()
    }

    fn note_success(&self, role: AgentRole, instance: &str) {
        if let Some(b) = self.breakers.lock().get_mut(&(role, instance.to_string())) {
            b.on_success();
        }
    }

    fn note_failure(&self, role: AgentRole, instance: &str) {
        if let Some(b) = self.breakers.lock().get_mut(&(role, instance.to_string())) {
            b.on_failure();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        session_id: &SessionId,
        step_id: &StepId,
        role: AgentRole,
        attempt: u32,
        started_at: DateTime<Utc>,
        outcome: InvocationOutcome,
        correlation: &CorrelationId,
        span: SpanId,
    ) {
        let record = InvocationRecord {
            id: InvocationId::generate(),
            session_id: session_id.clone(),
            step_id: step_id.clone(),
            role,
            attempt,
            started_at,
            ended_at: Utc::now(),
            outcome,
            correlation: correlation.clone(),
            span,
        };
        self.invocations
            .write()
            .entry(session_id.clone())
            .or_default()
            .push(record);
    }
}

/// Stable idempotency key over (session, step, first-attempt payload).
fn request_key(session_id: &SessionId, step_id: &StepId, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(step_id.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(payload.to_string().as_bytes());
    format!(
        "{session_id}\u{1f}{}",
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>()
    )
}
