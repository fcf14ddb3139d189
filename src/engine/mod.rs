//! The workflow engine: the only component that sees a session's whole
//! lifecycle.
//!
//! The engine composes every lower layer -- storage ports, the agent
//! dispatcher, the detection coordinator, the validation aggregator, the
//! provenance recorder, and the event bus -- into the protocol-independent
//! orchestration API consumed by all three transport adapters:
//!
//! | Operation | Behavior |
//! |---|---|
//! | [`submit`](WorkflowEngine::submit) | create a session in `Analyzing`, persist v1, start the driver |
//! | [`status`](WorkflowEngine::status) | read-only snapshot, never blocks mutations |
//! | [`resume`](WorkflowEngine::resume) | re-enter from the latest valid checkpoint |
//! | [`provide_input`](WorkflowEngine::provide_input) | validate against the pending prompt, resume |
//! | [`cancel`](WorkflowEngine::cancel) | cooperative, idempotent cancellation |
//! | [`provenance`](WorkflowEngine::provenance) | stream the PROV-O log |
//! | [`subscribe`](WorkflowEngine::subscribe) | event stream with replay |
//! | [`list_sessions`](WorkflowEngine::list_sessions) | summaries, optionally per principal |
//! | [`validate_standalone`](WorkflowEngine::validate_standalone) | one-shot ensemble validation |
//!
//! Mutations to one session are serialized through a per-session exclusive
//! lock; independent sessions run concurrently under a global permit cap.
//! Within a session the engine guarantees: checkpoint persistence precedes
//! the matching `StepCompleted` event, and `InputRequired` precedes
//! `StateChanged(Suspended)`.

mod execution;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::{ConfigHandle, ConfigLayers};
use crate::dispatch::{AgentDispatcher, AgentPort, AgentReply, DispatchError};
use crate::errors::OrchestratorError;
use crate::event_bus::{EventBus, EventSubscription, SubscribeFrom, WorkflowEvent};
use crate::provenance::{InMemoryProvenanceStore, ProvenanceRecorder, ProvenanceStore, Triple};
use crate::session::{Session, SessionPhase, SessionSnapshot, SessionSummary};
use crate::storage::{
    CheckpointStore, InMemoryCheckpointStore, InMemorySessionStore, SessionStore, StorageError,
};
use crate::types::{CorrelationId, Principal, SessionId};
use crate::validation::{self, ValidationReport, ValidatorResponse};
use crate::workflow::{standard_conversion_workflow, StepDefinition, WorkflowDefinition};

pub(crate) struct EngineInner {
    pub(crate) workflows: parking_lot::RwLock<FxHashMap<String, Arc<WorkflowDefinition>>>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) dispatcher: Arc<AgentDispatcher>,
    pub(crate) provenance: Arc<ProvenanceRecorder>,
    pub(crate) bus: EventBus,
    pub(crate) config: ConfigHandle,
    pub(crate) locks: Mutex<FxHashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    pub(crate) cancel_tokens: Mutex<FxHashMap<SessionId, CancellationToken>>,
    pub(crate) session_permits: Arc<Semaphore>,
    pub(crate) drivers: Mutex<FxHashMap<SessionId, JoinHandle<()>>>,
}

/// Builder wiring ports and configuration into a [`WorkflowEngine`].
///
/// Everything except the agent port has an in-memory default, so tests and
/// embedded deployments can start with just `WorkflowEngineBuilder::new(port)`.
/// The standard conversion workflow is always registered; additional
/// workflows register at build time (no dynamic plugin loading).
pub struct WorkflowEngineBuilder {
    port: Arc<dyn AgentPort>,
    session_store: Option<Arc<dyn SessionStore>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    provenance_store: Option<Arc<dyn ProvenanceStore>>,
    config: Option<ConfigHandle>,
    event_bus: Option<EventBus>,
    workflows: Vec<WorkflowDefinition>,
}

impl WorkflowEngineBuilder {
    #[must_use]
    pub fn new(port: Arc<dyn AgentPort>) -> Self {
        Self {
            port,
            session_store: None,
            checkpoint_store: None,
            provenance_store: None,
            config: None,
            event_bus: None,
            workflows: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_provenance_store(mut self, store: Arc<dyn ProvenanceStore>) -> Self {
        self.provenance_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ConfigHandle) -> Self {
        self.config = Some(config);
        self
    }

    /// Share an existing event bus, e.g. one backed by a durable event log
    /// that must survive orchestrator restarts.
    #[must_use]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    #[must_use]
    pub fn register_workflow(mut self, workflow: WorkflowDefinition) -> Self {
        self.workflows.push(workflow);
        self
    }

    #[must_use]
    pub fn build(self) -> WorkflowEngine {
        let config = self.config.unwrap_or_default();
        let sessions = self
            .session_store
            .unwrap_or_else(|| Arc::new(InMemorySessionStore::new()));
        let checkpoints = self
            .checkpoint_store
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));
        let provenance_store = self
            .provenance_store
            .unwrap_or_else(|| Arc::new(InMemoryProvenanceStore::new()));

        let mut workflows: FxHashMap<String, Arc<WorkflowDefinition>> = FxHashMap::default();
        let standard = standard_conversion_workflow();
        workflows.insert(standard.name().to_string(), Arc::new(standard));
        for workflow in self.workflows {
            workflows.insert(workflow.name().to_string(), Arc::new(workflow));
        }

        let max_sessions = config.current().engine.max_concurrent_sessions.max(1);
        WorkflowEngine {
            inner: Arc::new(EngineInner {
                workflows: parking_lot::RwLock::new(workflows),
                sessions,
                checkpoints,
                dispatcher: Arc::new(AgentDispatcher::new(self.port, config.clone())),
                provenance: Arc::new(ProvenanceRecorder::new(provenance_store, config.clone())),
                bus: self
                    .event_bus
                    .unwrap_or_else(|| EventBus::new(config.clone())),
                config,
                locks: Mutex::new(FxHashMap::default()),
                cancel_tokens: Mutex::new(FxHashMap::default()),
                session_permits: Arc::new(Semaphore::new(max_sessions)),
                drivers: Mutex::new(FxHashMap::default()),
            }),
        }
    }
}

/// Cloneable handle on the orchestration core.
#[derive(Clone)]
pub struct WorkflowEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Create a new session and start driving its workflow.
    ///
    /// Returns as soon as the session is durably created; execution
    /// proceeds in a background driver task and is observable through
    /// [`subscribe`](Self::subscribe) and [`status`](Self::status).
    #[instrument(skip(self, dataset), fields(workflow = workflow_ref, principal = %principal), err)]
    pub async fn submit(
        &self,
        workflow_ref: &str,
        dataset: Value,
        principal: Principal,
    ) -> Result<SessionId, OrchestratorError> {
        let workflow = self
            .workflow(workflow_ref)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow {
                reference: workflow_ref.to_string(),
            })?;

        let cfg = self
            .inner
            .config
            .resolve(Some(&principal), Some(workflow.name()));
        let session = Session::new(
            principal,
            workflow.name(),
            dataset,
            cfg.session.expire_after_ms,
            self.inner.config.snapshot_id(),
            cfg.engine.auto_fix_attempts,
        );
        let session = self.inner.sessions.create(session).await?;
        let session_id = session.id.clone();

        self.inner.bus.ensure_session(&session_id);
        self.inner.bus.publish(
            &session_id,
            WorkflowEvent::StateChanged {
                from: None,
                to: SessionPhase::Analyzing,
            },
        );

        self.spawn_driver(session_id.clone());
        Ok(session_id)
    }

    /// Current state, version, step, completion fraction, latest event seq.
    pub async fn status(&self, id: &SessionId) -> Result<SessionSnapshot, OrchestratorError> {
        let session = self.load(id).await?;
        let workflow = self.workflow(&session.workflow);
        let outputs = self
            .inner
            .checkpoints
            .latest_valid(id)
            .await?
            .map(|cp| cp.outputs)
            .unwrap_or_default();

        let (completion, current_step) = match &workflow {
            Some(wf) if !wf.is_empty() => {
                let completion = outputs.len() as f64 / wf.len() as f64;
                let current = if session.phase.is_terminal() {
                    None
                } else if let Some(pending) = &session.pending_input {
                    Some(pending.step.clone())
                } else {
                    wf.ready_steps(&outputs).into_iter().next()
                };
                (completion, current)
            }
            _ => (0.0, None),
        };

        Ok(SessionSnapshot {
            id: session.id.clone(),
            phase: session.phase,
            version: session.version,
            current_step,
            completion,
            latest_seq: self.inner.bus.latest_seq(id),
            error: session.error,
            updated_at: session.updated_at,
        })
    }

    /// Re-enter execution from the latest valid checkpoint.
    ///
    /// Legal from `Suspended` or from `Failed` with a retryable error
    /// record; anything else is `TerminalState`. Steps whose outputs are
    /// already checkpointed are not re-executed.
    #[instrument(skip(self), err)]
    pub async fn resume(&self, id: &SessionId) -> Result<(), OrchestratorError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let mut session = self.load(id).await?;
        let target = self.resume_target(&session).await?;
        let from = session.phase;
        match session.phase {
            SessionPhase::Suspended => {
                session.pending_input = None;
                session.transition(target)?;
            }
            SessionPhase::Failed => {
                session.reopen(target)?;
            }
            phase if phase.is_terminal() => {
                return Err(OrchestratorError::TerminalState {
                    session_id: id.clone(),
                    phase,
                });
            }
            // Already running; resume is a no-op acknowledgement.
            _ => return Ok(()),
        }
        let session = self.persist(session).await?;
        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::StateChanged {
                from: Some(from),
                to: session.phase,
            },
        );
        drop(_guard);
        self.spawn_driver(id.clone());
        Ok(())
    }

    /// Supply the input a suspended session is waiting for.
    #[instrument(skip(self, input), err)]
    pub async fn provide_input(
        &self,
        id: &SessionId,
        input: Value,
    ) -> Result<(), OrchestratorError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let mut session = self.load(id).await?;
        if session.phase.is_terminal() {
            return Err(OrchestratorError::TerminalState {
                session_id: id.clone(),
                phase: session.phase,
            });
        }
        let Some(pending) = session.pending_input.clone() else {
            return Err(OrchestratorError::NotSuspended {
                session_id: id.clone(),
            });
        };
        if session.phase != SessionPhase::Suspended {
            return Err(OrchestratorError::NotSuspended {
                session_id: id.clone(),
            });
        }

        let violations = pending.schema.violations(&input);
        if !violations.is_empty() {
            return Err(OrchestratorError::InputSchemaMismatch {
                detail: violations.join("; "),
            });
        }

        session.user_input = Some(input);
        session.pending_input = None;
        session.transition(pending.resume_to)?;
        let session = self.persist(session).await?;
        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::StateChanged {
                from: Some(SessionPhase::Suspended),
                to: session.phase,
            },
        );
        drop(_guard);
        self.spawn_driver(id.clone());
        Ok(())
    }

    /// Request cooperative cancellation. Idempotent: cancelling a session
    /// that is already terminal succeeds as a no-op.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, id: &SessionId) -> Result<(), OrchestratorError> {
        let session = self.load(id).await?;
        if session.phase.is_terminal() {
            return Ok(());
        }

        self.cancel_token(id).cancel();

        let driver_active = self
            .inner
            .drivers
            .lock()
            .get(id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if driver_active {
            // The driver observes the token, lets in-flight invocations
            // terminate, and finalizes the session itself.
            return Ok(());
        }

        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        let session = self.load(id).await?;
        if session.phase.is_terminal() {
            return Ok(());
        }
        self.finalize_cancelled(session).await?;
        Ok(())
    }

    /// Stream the accumulated PROV-O log.
    pub async fn provenance(&self, id: &SessionId) -> Result<Vec<Triple>, OrchestratorError> {
        // Surface NotFound for unknown sessions rather than an empty graph.
        self.load(id).await?;
        match self.inner.provenance.read(id).await {
            Ok(triples) => Ok(triples),
            Err(StorageError::NotFound { .. }) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Subscribe to a session's event stream.
    pub async fn subscribe(
        &self,
        id: &SessionId,
        from: SubscribeFrom,
    ) -> Result<EventSubscription, OrchestratorError> {
        self.load(id).await?;
        self.inner.bus.ensure_session(id);
        self.inner
            .bus
            .subscribe(id, from)
            .ok_or_else(|| OrchestratorError::NotFound {
                session_id: id.clone(),
            })
    }

    /// Retained events from a sequence number, without subscribing.
    pub async fn events(
        &self,
        id: &SessionId,
        from: u64,
    ) -> Result<Vec<crate::event_bus::SequencedEvent>, OrchestratorError> {
        self.load(id).await?;
        Ok(self.inner.bus.replay(id, from))
    }

    /// Session summaries, optionally filtered to one principal.
    pub async fn list_sessions(
        &self,
        principal: Option<&Principal>,
    ) -> Result<Vec<SessionSummary>, OrchestratorError> {
        let mut sessions = self.inner.sessions.list().await?;
        if let Some(p) = principal {
            sessions.retain(|s| &s.principal == p);
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions.iter().map(SessionSummary::from).collect())
    }

    /// Run the validator ensemble against a file outside any workflow.
    #[instrument(skip(self, file_ref), err)]
    pub async fn validate_standalone(
        &self,
        file_ref: Value,
        validators: Vec<String>,
    ) -> Result<ValidationReport, OrchestratorError> {
        let step = StepDefinition::new("validate-standalone", crate::types::AgentRole::Evaluation)
            .validation();
        let payload = serde_json::json!({
            "file": file_ref,
            "validators": validators,
        });
        let scratch = SessionId::generate();
        let correlation = CorrelationId::generate();
        let cancel = CancellationToken::new();

        let outcome = self
            .inner
            .dispatcher
            .dispatch(&step, payload, &scratch, &correlation, &cancel)
            .await;
        self.inner.dispatcher.forget_session(&scratch);

        let reply = outcome.map_err(|err| OrchestratorError::ValidatorUnavailable {
            detail: err.to_string(),
        })?;
        match reply {
            AgentReply::Ok(value) => {
                let responses = parse_validator_responses(&value).map_err(|detail| {
                    OrchestratorError::ValidatorUnavailable { detail }
                })?;
                let cfg = self.inner.config.current();
                Ok(validation::aggregate(
                    &responses,
                    cfg.validation.weights,
                    cfg.validation.vote,
                ))
            }
            _ => Err(OrchestratorError::ValidatorUnavailable {
                detail: "evaluation worker returned a non-terminal reply".to_string(),
            }),
        }
    }

    /// Expiration sweep: fail suspensions past their input deadline, purge
    /// sessions past their TTL. Returns the purged session ids.
    pub async fn expire_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionId>, OrchestratorError> {
        let sessions = self.inner.sessions.list().await?;
        let mut purged = Vec::new();

        for session in sessions {
            if session.phase == SessionPhase::Suspended {
                if let Some(pending) = &session.pending_input {
                    if pending.deadline <= now {
                        let lock = self.session_lock(&session.id);
                        let _guard = lock.lock().await;
                        let fresh = self.load(&session.id).await?;
                        if fresh.phase == SessionPhase::Suspended {
                            self.fail_user_input_timeout(fresh).await?;
                        }
                        continue;
                    }
                }
            }
            if session.is_expired(now) {
                let id = session.id.clone();
                self.inner.sessions.purge(&id).await?;
                self.inner.checkpoints.purge(&id).await?;
                let _ = self.inner.provenance.purge(&id).await;
                self.inner.bus.purge_session(&id);
                self.inner.dispatcher.forget_session(&id);
                purged.push(id);
            }
        }
        Ok(purged)
    }

    /// Hot-reload configuration layers; emits `ConfigChanged` to every
    /// active session and returns the new snapshot id.
    pub async fn reload_config(
        &self,
        layers: ConfigLayers,
    ) -> Result<String, OrchestratorError> {
        let snapshot = self.inner.config.reload(layers);
        for session in self.inner.sessions.list().await? {
            if !session.phase.is_terminal() {
                self.inner.bus.publish(
                    &session.id,
                    WorkflowEvent::ConfigChanged {
                        snapshot: snapshot.clone(),
                    },
                );
            }
        }
        Ok(snapshot)
    }

    /// Dispatcher handle, for invocation audit queries.
    #[must_use]
    pub fn dispatcher(&self) -> &AgentDispatcher {
        &self.inner.dispatcher
    }

    /// Wait until the session's driver task (if any) has parked.
    ///
    /// Test and shutdown aid: the driver parks when the session suspends,
    /// fails, completes, or is cancelled.
    pub async fn wait_until_parked(&self, id: &SessionId) {
        let handle = self.inner.drivers.lock().remove(id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub(crate) fn workflow(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner.workflows.read().get(name).cloned()
    }

    pub(crate) async fn load(&self, id: &SessionId) -> Result<Session, OrchestratorError> {
        match self.inner.sessions.load_latest(id).await {
            Ok(session) => Ok(session),
            Err(StorageError::NotFound { session_id }) => {
                Err(OrchestratorError::NotFound { session_id })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn persist(&self, mut session: Session) -> Result<Session, OrchestratorError> {
        // TTL counts from the last update; every persisted mutation pushes
        // the expiration instant out.
        let ttl = self
            .inner
            .config
            .resolve(Some(&session.principal), Some(&session.workflow))
            .session
            .expire_after_ms;
        session.expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let expected = session.version;
        match self.inner.sessions.persist(session, expected).await {
            Ok(session) => Ok(session),
            Err(StorageError::Conflict {
                session_id,
                expected,
                actual,
            }) => Err(OrchestratorError::Concurrency {
                session_id,
                expected,
                actual,
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn session_lock(&self, id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .locks
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub(crate) fn cancel_token(&self, id: &SessionId) -> CancellationToken {
        self.inner
            .cancel_tokens
            .lock()
            .entry(id.clone())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    pub(crate) fn spawn_driver(&self, id: SessionId) {
        let engine = self.clone();
        let driver_id = id.clone();
        let handle = tokio::spawn(async move {
            engine.drive(driver_id).await;
        });
        self.inner.drivers.lock().insert(id, handle);
    }

    async fn resume_target(&self, session: &Session) -> Result<SessionPhase, OrchestratorError> {
        if let Some(pending) = &session.pending_input {
            return Ok(pending.resume_to);
        }
        let workflow =
            self.workflow(&session.workflow)
                .ok_or_else(|| OrchestratorError::UnknownWorkflow {
                    reference: session.workflow.clone(),
                })?;
        let outputs = self
            .inner
            .checkpoints
            .latest_valid(&session.id)
            .await?
            .map(|cp| cp.outputs)
            .unwrap_or_default();
        let target = workflow
            .ready_steps(&outputs)
            .first()
            .and_then(|id| workflow.step(id))
            .map(|step| SessionPhase::for_role(step.role))
            .unwrap_or(SessionPhase::Validating);
        Ok(target)
    }
}

/// Accept either a bare array of validator responses or an object wrapping
/// them under `validators`/`responses`.
pub(crate) fn parse_validator_responses(
    value: &Value,
) -> Result<Vec<ValidatorResponse>, String> {
    let candidate = if value.is_array() {
        value
    } else if let Some(inner) = value.get("validators").or_else(|| value.get("responses")) {
        inner
    } else {
        return Err("evaluation reply carries no validator responses".to_string());
    };
    serde_json::from_value(candidate.clone())
        .map_err(|e| format!("malformed validator responses: {e}"))
}

/// Accept either a bare array of detector contributions or an object
/// wrapping them under `contributions`.
pub(crate) fn parse_detector_contributions(
    value: &Value,
) -> Result<Vec<crate::detection::DetectorContribution>, String> {
    let candidate = if value.is_array() {
        value
    } else if let Some(inner) = value.get("contributions") {
        inner
    } else {
        return Err("detection reply carries no contributions".to_string());
    };
    serde_json::from_value(candidate.clone())
        .map_err(|e| format!("malformed detector contributions: {e}"))
}

/// Helper shared with the driver: map a dispatch error onto the error
/// taxonomy for the session error record.
pub(crate) fn dispatch_error_kind(err: &DispatchError) -> crate::errors::ErrorKind {
    match err {
        DispatchError::CircuitOpen { .. } => crate::errors::ErrorKind::CircuitOpen,
        DispatchError::Timeout { .. } => crate::errors::ErrorKind::Timeout,
        DispatchError::RetriesExhausted { .. } => crate::errors::ErrorKind::AgentPermanentFailure,
        DispatchError::Permanent { .. } => crate::errors::ErrorKind::AgentPermanentFailure,
        DispatchError::Cancelled { .. } => crate::errors::ErrorKind::Internal,
    }
}

// Re-exported for adapter convenience.
pub use crate::workflow::STANDARD_WORKFLOW;
