//! Resilient dispatch to external worker roles.
//!
//! The orchestrator never speaks to a worker directly: every step execution
//! goes through the [`AgentDispatcher`], which wraps the abstract
//! [`AgentPort`] with uniform behaviors applied identically to all four
//! roles:
//!
//! - **Timeouts** bound every invocation by the step's (or configured)
//!   deadline and signal cancellation to the port on expiry.
//! - **Retries** re-dispatch transient failures with exponential backoff
//!   and bounded jitter ([`RetryPolicy`]); permanent failures never retry.
//! - **Circuit breakers** guard each `(role, instance)` destination
//!   ([`CircuitBreaker`]); open circuits fail fast with `CircuitOpen`.
//! - **Deduplication** returns the cached first response for idempotent
//!   steps re-dispatched with an identical payload.
//! - **Tracing** propagates a session correlation id and a fresh span id
//!   per attempt.
//!
//! The dispatcher knows nothing about what a worker does beyond the role
//! tag it buckets breakers and concurrency permits by; the port hides all
//! wire detail.

mod circuit;
mod dispatcher;
mod retry;

pub use circuit::{Admission, CircuitBreaker, CircuitConfig, CircuitState};
pub use dispatcher::{AgentDispatcher, DispatchError, InvocationOutcome, InvocationRecord};
pub use retry::RetryPolicy;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::session::PromptSchema;
use crate::types::{AgentRole, CorrelationId, SessionId, SpanId, StepId};

/// Serde helper: `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// One request handed to a worker.
#[derive(Clone, Debug)]
pub struct AgentRequest {
    pub session_id: SessionId,
    pub step_id: StepId,
    pub role: AgentRole,
    /// 1-based attempt number; retries increment it.
    pub attempt: u32,
    pub payload: Value,
    /// Correlation id spanning the session, for distributed tracing.
    pub correlation: CorrelationId,
    /// Span id unique to this attempt.
    pub span: SpanId,
}

/// Tagged worker response.
#[derive(Clone, Debug)]
pub enum AgentReply {
    /// The step finished; the payload becomes its recorded output.
    Ok(Value),
    /// The step needs user input; the workflow suspends.
    InputRequired {
        schema: PromptSchema,
        /// Worker-suggested cap on how long to wait for the input.
        timeout: Option<Duration>,
    },
    /// Transient failure the dispatcher may retry.
    RetryableFailure { reason: String },
    /// Declared non-retryable failure.
    PermanentFailure {
        reason: String,
        fix_hint: Option<String>,
    },
}

/// Transport-level failure raised by an [`AgentPort`] implementation.
#[derive(Clone, Debug, Error)]
#[error("agent port error: {message}")]
pub struct AgentError {
    pub retryable: bool,
    pub message: String,
    pub fix_hint: Option<String>,
}

impl AgentError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
            fix_hint: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
            fix_hint: None,
        }
    }
}

/// Abstract transport to the external worker fleet.
///
/// Implementations must honor the deadline and return promptly when the
/// cancellation token fires; the core makes no other transport assumption.
#[async_trait]
pub trait AgentPort: Send + Sync {
    async fn invoke(
        &self,
        request: AgentRequest,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<AgentReply, AgentError>;

    /// Identity of the worker instance serving `role`, used for
    /// circuit-breaker bucketing.
    fn instance_id(&self, role: AgentRole) -> String {
        let _ = role;
        "default".to_string()
    }
}
