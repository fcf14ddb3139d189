//! Scriptable agent port implementations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use nwbflow::dispatch::{AgentError, AgentPort, AgentReply, AgentRequest};
use nwbflow::session::PromptSchema;
use nwbflow::types::StepId;

/// One scripted worker behavior.
#[derive(Clone, Debug)]
pub enum Script {
    Ok(Value),
    InputRequired(PromptSchema, Option<Duration>),
    Retryable(String),
    Permanent(String),
    /// Sleep until cancelled (or an absurdly long deadline), honoring the
    /// cooperative-cancellation contract.
    Hang,
    /// Delay, then act as the inner script.
    Delayed(Duration, Box<Script>),
}

/// An [`AgentPort`] driven by per-step script queues.
///
/// `enqueue` pushes one-shot behaviors consumed in order; `set_default`
/// installs the behavior used once the queue is empty. Steps with neither
/// reply `Ok({"ok": true})`.
#[derive(Default)]
pub struct ScriptedPort {
    queues: Mutex<FxHashMap<StepId, VecDeque<Script>>>,
    defaults: Mutex<FxHashMap<StepId, Script>>,
    calls: Mutex<FxHashMap<StepId, usize>>,
    total_calls: AtomicUsize,
}

impl ScriptedPort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue(&self, step: impl Into<StepId>, script: Script) {
        self.queues
            .lock()
            .entry(step.into())
            .or_default()
            .push_back(script);
    }

    pub fn set_default(&self, step: impl Into<StepId>, script: Script) {
        self.defaults.lock().insert(step.into(), script);
    }

    /// Worker invocations observed for one step.
    pub fn calls(&self, step: impl Into<StepId>) -> usize {
        self.calls.lock().get(&step.into()).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::Relaxed)
    }

    fn next_script(&self, step: &StepId) -> Script {
        if let Some(script) = self
            .queues
            .lock()
            .get_mut(step)
            .and_then(VecDeque::pop_front)
        {
            return script;
        }
        self.defaults
            .lock()
            .get(step)
            .cloned()
            .unwrap_or(Script::Ok(serde_json::json!({ "ok": true })))
    }

    async fn perform(
        &self,
        script: Script,
        cancel: &CancellationToken,
    ) -> Result<AgentReply, AgentError> {
        match script {
            Script::Ok(value) => Ok(AgentReply::Ok(value)),
            Script::InputRequired(schema, timeout) => {
                Ok(AgentReply::InputRequired { schema, timeout })
            }
            Script::Retryable(reason) => Ok(AgentReply::RetryableFailure { reason }),
            Script::Permanent(reason) => Ok(AgentReply::PermanentFailure {
                reason,
                fix_hint: Some("check the dataset layout".to_string()),
            }),
            Script::Hang => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(AgentError::retryable("cancelled by orchestrator")),
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                        Err(AgentError::retryable("hang elapsed"))
                    }
                }
            }
            Script::Delayed(delay, inner) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(AgentError::retryable("cancelled by orchestrator")),
                    _ = tokio::time::sleep(delay) => Box::pin(self.perform(*inner, cancel)).await,
                }
            }
        }
    }
}

#[async_trait]
impl AgentPort for ScriptedPort {
    async fn invoke(
        &self,
        request: AgentRequest,
        _deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<AgentReply, AgentError> {
        *self.calls.lock().entry(request.step_id.clone()).or_default() += 1;
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let script = self.next_script(&request.step_id);
        self.perform(script, &cancel).await
    }
}
