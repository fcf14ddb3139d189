//! Driver internals: the per-session execution loop.
//!
//! One driver task owns a session from (re)entry until it parks: on
//! completion, failure, cancellation, or suspension. The loop repeatedly
//! selects ready steps (deterministic step-id order, bounded by
//! `engine.max_parallel_steps`), dispatches them concurrently, folds the
//! outputs, persists a checkpoint, and emits events -- with the checkpoint
//! write strictly preceding the corresponding `StepCompleted` event.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use crate::checkpoint::Checkpoint;
use crate::detection::{self, FormatDetection, InterfaceCatalog};
use crate::dispatch::{AgentReply, DispatchError};
use crate::errors::{ErrorKind, OrchestratorError};
use crate::event_bus::{CompletionSummary, EventSeverity, WorkflowEvent};
use crate::provenance::{ActivityRecord, AttemptSpan, RecordOutcome};
use crate::session::{
    ErrorRecord, PendingInput, PromptField, PromptSchema, Session, SessionPhase,
};
use crate::types::SessionId;
use crate::validation::{self, ValidationReport, ValidationStatus};
use crate::workflow::{StepDefinition, StepInputs, StepOutputs, WorkflowDefinition};

use super::{dispatch_error_kind, parse_detector_contributions, parse_validator_responses};

const PENDING_DETECTION_KEY: &str = "pending_detection";

/// What one dispatched step contributed to the scheduling round.
enum StepOutcome {
    Completed {
        step: Arc<StepDefinition>,
        value: Value,
        validation: Option<ValidationReport>,
    },
    Suspend {
        step: Arc<StepDefinition>,
        schema: PromptSchema,
        worker_timeout: Option<Duration>,
        detection: Option<FormatDetection>,
    },
    Failed {
        step: Arc<StepDefinition>,
        error: DispatchError,
    },
}

impl super::WorkflowEngine {
    /// Entry point of the driver task spawned per session (re)entry.
    #[instrument(skip(self), fields(session = %session_id))]
    pub(crate) async fn drive(&self, session_id: SessionId) {
        let Ok(_permit) = self.inner.session_permits.clone().acquire_owned().await else {
            return;
        };
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;
        let cancel = self.cancel_token(&session_id);

        if let Err(err) = self.drive_locked(&session_id, &cancel).await {
            error!(session = %session_id, error = %err, "driver aborted; failing session");
            if let Err(inner) = self.fail_internal(&session_id, &err).await {
                error!(session = %session_id, error = %inner, "unable to record session failure");
            }
        }
    }

    async fn drive_locked(
        &self,
        id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        loop {
            let mut session = self.load(id).await?;
            if session.phase.is_terminal() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                self.finalize_cancelled(session).await?;
                return Ok(());
            }

            let workflow = self.workflow(&session.workflow).ok_or_else(|| {
                OrchestratorError::UnknownWorkflow {
                    reference: session.workflow.clone(),
                }
            })?;
            let mut outputs = self
                .inner
                .checkpoints
                .latest_valid(id)
                .await?
                .map(|cp| cp.outputs)
                .unwrap_or_default();

            let ready = workflow.ready_steps(&outputs);
            if ready.is_empty() {
                self.complete_session(session, &workflow, &outputs).await?;
                return Ok(());
            }

            let cfg = self
                .inner
                .config
                .resolve(Some(&session.principal), Some(&session.workflow));
            let batch: Vec<Arc<StepDefinition>> = ready
                .iter()
                .take(cfg.engine.max_parallel_steps.max(1))
                .filter_map(|step_id| workflow.step(step_id).cloned())
                .collect();
            if batch.is_empty() {
                return Err(OrchestratorError::UnknownWorkflow {
                    reference: session.workflow.clone(),
                });
            }

            // A previously ambiguous detection resolves from user input
            // without another worker round-trip.
            if let Some(step) = batch.iter().find(|s| s.is_detection) {
                if let Some(resolved) =
                    resolve_pending_detection(&mut session, &cfg.detection.interfaces)?
                {
                    outputs.insert(step.id.clone(), resolved);
                    let session = self.checkpointed_persist(session, &workflow, &outputs).await?;
                    self.inner.bus.publish(
                        &session.id,
                        WorkflowEvent::StepCompleted {
                            step: step.id.clone(),
                        },
                    );
                    continue;
                }
            }

            // The session phase follows the first step of the round; mixed
            // batches keep the earliest phase until later rounds.
            session = self
                .advance_phase(session, SessionPhase::for_role(batch[0].role))
                .await?;

            let total_steps = workflow.len().max(1);
            for step in &batch {
                self.inner.bus.publish(
                    &session.id,
                    WorkflowEvent::StepProgress {
                        step: step.id.clone(),
                        fraction: outputs.len() as f64 / total_steps as f64,
                        message: format!("dispatching {}", step.id),
                    },
                );
                self.inner.bus.publish(
                    &session.id,
                    WorkflowEvent::StepStarted {
                        step: step.id.clone(),
                    },
                );
            }

            let dataset = session.dataset.clone();
            let user_input = session.user_input.clone();
            let correlation = session.correlation.clone();
            let dispatches = batch.iter().map(|step| {
                let payload = step.build_input(&StepInputs {
                    dataset: &dataset,
                    outputs: &outputs,
                    user_input: user_input.as_ref(),
                });
                let step = step.clone();
                let correlation = correlation.clone();
                async move {
                    let result = self
                        .inner
                        .dispatcher
                        .dispatch(&step, payload, id, &correlation, cancel)
                        .await;
                    (step, result)
                }
            });
            let results = futures_util::future::join_all(dispatches).await;

            let mut completed = Vec::new();
            let mut suspension = None;
            let mut failure = None;
            for (step, result) in results {
                match self.classify(&session, step, result, &cfg)? {
                    StepOutcome::Completed {
                        step,
                        value,
                        validation,
                    } => completed.push((step, value, validation)),
                    outcome @ StepOutcome::Suspend { .. } => {
                        if suspension.is_none() {
                            suspension = Some(outcome);
                        }
                    }
                    outcome @ StepOutcome::Failed { .. } => {
                        if failure.is_none() {
                            failure = Some(outcome);
                        }
                    }
                }
            }

            if cancel.is_cancelled() {
                self.finalize_cancelled(session).await?;
                return Ok(());
            }

            let mut failed_validation = None;
            for (step, value, validation) in &completed {
                outputs.insert(step.id.clone(), value.clone());
                if let Some(report) = validation {
                    if report.status == ValidationStatus::Fail {
                        failed_validation = Some((step.clone(), report.clone()));
                    }
                }
            }
            if !completed.is_empty() && session.user_input.is_some() {
                session.user_input = None;
            }

            if !completed.is_empty() {
                session = self.checkpointed_persist(session, &workflow, &outputs).await?;
                for (step, _, _) in &completed {
                    let fatal = self.record_step_provenance(&session, step).await;
                    self.inner.bus.publish(
                        &session.id,
                        WorkflowEvent::StepCompleted {
                            step: step.id.clone(),
                        },
                    );
                    if fatal {
                        let record = ErrorRecord {
                            kind: ErrorKind::ProvenanceDegraded,
                            step: Some(step.id.clone()),
                            role: Some(step.role),
                            message: "provenance store unavailable beyond tolerance".to_string(),
                            fix_hint: None,
                            correlation: session.correlation.clone(),
                            retryable: true,
                        };
                        self.fail_session(session, record, &outputs, &workflow).await?;
                        return Ok(());
                    }
                }
            }

            if let Some(StepOutcome::Suspend {
                step,
                schema,
                worker_timeout,
                detection,
            }) = suspension
            {
                if let Some(detection) = detection {
                    session.metadata.insert(
                        PENDING_DETECTION_KEY.to_string(),
                        serde_json::to_value(&detection).unwrap_or(Value::Null),
                    );
                }
                self.suspend_session(session, &step, schema, worker_timeout, &workflow, &outputs)
                    .await?;
                return Ok(());
            }

            if let Some((step, report)) = failed_validation {
                if self
                    .handle_validation_failure(session, &step, report, &workflow, outputs)
                    .await?
                {
                    // Auto-fix budget funded another loop; keep driving.
                    continue;
                }
                return Ok(());
            }

            if let Some(StepOutcome::Failed { step, error }) = failure {
                if matches!(error, DispatchError::Cancelled { .. }) {
                    self.finalize_cancelled(session).await?;
                    return Ok(());
                }
                let record = ErrorRecord {
                    kind: dispatch_error_kind(&error),
                    step: Some(step.id.clone()),
                    role: Some(step.role),
                    message: error.to_string(),
                    fix_hint: match &error {
                        DispatchError::Permanent { fix_hint, .. } => fix_hint.clone(),
                        _ => None,
                    },
                    correlation: session.correlation.clone(),
                    retryable: error.retryable(),
                };
                self.fail_session(session, record, &outputs, &workflow).await?;
                return Ok(());
            }
        }
    }

    /// Interpret one dispatch result in the context of the step kind.
    fn classify(
        &self,
        session: &Session,
        step: Arc<StepDefinition>,
        result: Result<AgentReply, DispatchError>,
        cfg: &crate::config::OrchestratorConfig,
    ) -> Result<StepOutcome, OrchestratorError> {
        match result {
            Ok(AgentReply::Ok(value)) if step.is_detection => {
                let contributions = match parse_detector_contributions(&value) {
                    Ok(contributions) => contributions,
                    Err(detail) => {
                        return Ok(StepOutcome::Failed {
                            error: DispatchError::Permanent {
                                role: step.role,
                                step: step.id.clone(),
                                message: detail,
                                fix_hint: None,
                            },
                            step,
                        });
                    }
                };
                let catalog = InterfaceCatalog::new(cfg.detection.interfaces.clone());
                let detection = detection::coordinate(
                    &contributions,
                    &catalog,
                    cfg.detection.ambiguity_threshold,
                );
                if detection.ambiguous {
                    let schema = disambiguation_schema(&detection);
                    return Ok(StepOutcome::Suspend {
                        step,
                        schema,
                        worker_timeout: None,
                        detection: Some(detection),
                    });
                }
                let value = serde_json::to_value(&detection).unwrap_or(Value::Null);
                Ok(StepOutcome::Completed {
                    step,
                    value,
                    validation: None,
                })
            }
            Ok(AgentReply::Ok(value)) if step.is_validation => {
                match parse_validator_responses(&value) {
                    Ok(responses) => {
                        let report = validation::aggregate(
                            &responses,
                            cfg.validation.weights,
                            cfg.validation.vote,
                        );
                        let value = serde_json::to_value(&report).unwrap_or(Value::Null);
                        Ok(StepOutcome::Completed {
                            step,
                            value,
                            validation: Some(report),
                        })
                    }
                    Err(detail) => Ok(StepOutcome::Failed {
                        error: DispatchError::Permanent {
                            role: step.role,
                            step: step.id.clone(),
                            message: detail,
                            fix_hint: None,
                        },
                        step,
                    }),
                }
            }
            Ok(AgentReply::Ok(value)) => Ok(StepOutcome::Completed {
                step,
                value,
                validation: None,
            }),
            Ok(AgentReply::InputRequired { schema, timeout }) => {
                if step.suspendable {
                    Ok(StepOutcome::Suspend {
                        step,
                        schema,
                        worker_timeout: timeout,
                        detection: None,
                    })
                } else {
                    warn!(session = %session.id, step = %step.id, "non-suspendable step requested input");
                    Ok(StepOutcome::Failed {
                        error: DispatchError::Permanent {
                            role: step.role,
                            step: step.id.clone(),
                            message: "worker requested input on a non-suspendable step".to_string(),
                            fix_hint: None,
                        },
                        step,
                    })
                }
            }
            // The dispatcher resolves failure replies itself; reaching here
            // means a port bypassed it, so treat as permanent.
            Ok(AgentReply::RetryableFailure { reason })
            | Ok(AgentReply::PermanentFailure { reason, .. }) => Ok(StepOutcome::Failed {
                error: DispatchError::Permanent {
                    role: step.role,
                    step: step.id.clone(),
                    message: reason,
                    fix_hint: None,
                },
                step,
            }),
            Err(error) => Ok(StepOutcome::Failed { step, error }),
        }
    }

    /// Persist the session, append a checkpoint at the persisted version,
    /// and persist the checkpoint reference. The checkpoint is durable
    /// before any `StepCompleted` event for this round is published.
    async fn checkpointed_persist(
        &self,
        session: Session,
        workflow: &WorkflowDefinition,
        outputs: &StepOutputs,
    ) -> Result<Session, OrchestratorError> {
        let mut session = self.persist(session).await?;
        let frontier = workflow.ready_steps(outputs);
        let checkpoint = Checkpoint::new(
            session.id.clone(),
            session.version,
            outputs.clone(),
            frontier,
        );
        self.inner.checkpoints.append(checkpoint).await?;
        session.checkpoint_versions.push(session.version);
        self.persist(session).await
    }

    /// Walk the phase machine toward `target`, emitting one `StateChanged`
    /// per hop. Directly adjacent targets take a single hop.
    async fn advance_phase(
        &self,
        mut session: Session,
        target: SessionPhase,
    ) -> Result<Session, OrchestratorError> {
        if session.phase == target {
            return Ok(session);
        }
        let mut hops = Vec::new();
        while session.phase != target {
            let from = session.phase;
            let next = if session.phase.can_transition_to(target) {
                target
            } else {
                forward_phase(session.phase).ok_or(OrchestratorError::InvalidStateTransition {
                    from: session.phase,
                    to: target,
                })?
            };
            session.transition(next)?;
            hops.push((from, next));
        }
        let session = self.persist(session).await?;
        for (from, to) in hops {
            self.inner.bus.publish(
                &session.id,
                WorkflowEvent::StateChanged {
                    from: Some(from),
                    to,
                },
            );
        }
        Ok(session)
    }

    /// Park the session awaiting user input. Emits `InputRequired` strictly
    /// before `StateChanged(Suspended)`.
    async fn suspend_session(
        &self,
        mut session: Session,
        step: &StepDefinition,
        schema: PromptSchema,
        worker_timeout: Option<Duration>,
        workflow: &WorkflowDefinition,
        outputs: &StepOutputs,
    ) -> Result<(), OrchestratorError> {
        let cfg = self
            .inner
            .config
            .resolve(Some(&session.principal), Some(&session.workflow));
        let wait = worker_timeout
            .map(|t| t.min(cfg.session.input_timeout_ms))
            .unwrap_or(cfg.session.input_timeout_ms);
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::hours(1));

        let from = session.phase;
        session.pending_input = Some(PendingInput {
            step: step.id.clone(),
            schema: schema.clone(),
            requested_at: now,
            deadline,
            resume_to: SessionPhase::for_role(step.role),
        });
        session.transition(SessionPhase::Suspended)?;
        let session = self.checkpointed_persist(session, workflow, outputs).await?;

        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::InputRequired {
                step: step.id.clone(),
                schema,
            },
        );
        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::StateChanged {
                from: Some(from),
                to: SessionPhase::Suspended,
            },
        );
        Ok(())
    }

    /// Validation returned `Fail`: loop back to metadata collection while
    /// the auto-fix budget lasts, otherwise fail the session.
    ///
    /// Returns `true` when another loop was scheduled.
    async fn handle_validation_failure(
        &self,
        mut session: Session,
        step: &StepDefinition,
        report: ValidationReport,
        workflow: &WorkflowDefinition,
        mut outputs: StepOutputs,
    ) -> Result<bool, OrchestratorError> {
        if session.auto_fix_remaining == 0 {
            let record = ErrorRecord {
                kind: ErrorKind::ValidationFailed,
                step: Some(step.id.clone()),
                role: Some(step.role),
                message: format!(
                    "validation failed with score {} ({} critical, {} error issues)",
                    report.score, report.counts.critical, report.counts.error
                ),
                fix_hint: report
                    .issues
                    .iter()
                    .find_map(|issue| issue.fix_hint.clone()),
                correlation: session.correlation.clone(),
                retryable: false,
            };
            self.fail_session(session, record, &outputs, workflow).await?;
            return Ok(false);
        }

        session.auto_fix_remaining -= 1;
        // Re-run everything from metadata collection onward; detection
        // output stays.
        outputs.retain(|step_id, _| {
            workflow
                .step(step_id)
                .map(|s| SessionPhase::for_role(s.role) == SessionPhase::Analyzing)
                .unwrap_or(false)
        });

        let from = session.phase;
        session.transition(SessionPhase::CollectingMetadata)?;
        let session = self.checkpointed_persist(session, workflow, &outputs).await?;

        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::ErrorRaised {
                kind: ErrorKind::ValidationFailed,
                severity: EventSeverity::Warning,
                recoverable: true,
                message: format!(
                    "validation failed (score {}); re-entering metadata collection",
                    report.score
                ),
                step: Some(step.id.clone()),
            },
        );
        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::StateChanged {
                from: Some(from),
                to: SessionPhase::CollectingMetadata,
            },
        );
        Ok(true)
    }

    /// All steps have outputs: walk to `Completed` and emit the summary.
    async fn complete_session(
        &self,
        session: Session,
        workflow: &WorkflowDefinition,
        outputs: &StepOutputs,
    ) -> Result<(), OrchestratorError> {
        let report = validation_report_from(workflow, outputs);
        let session = self.advance_phase(session, SessionPhase::Completed).await?;
        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::Completed {
                summary: CompletionSummary {
                    outcome: SessionPhase::Completed,
                    quality_score: report.as_ref().map(|r| r.score),
                    validation_status: report.as_ref().map(|r| r.status),
                    error: None,
                },
            },
        );
        Ok(())
    }

    /// Terminal failure: record, transition, and emit the structured
    /// summary (kind, failing step, role, message, hint, correlation id).
    pub(crate) async fn fail_session(
        &self,
        mut session: Session,
        record: ErrorRecord,
        outputs: &StepOutputs,
        workflow: &WorkflowDefinition,
    ) -> Result<(), OrchestratorError> {
        let from = session.phase;
        session.error = Some(record.clone());
        session.pending_input = None;
        session.transition(SessionPhase::Failed)?;
        let session = self.persist(session).await?;

        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::ErrorRaised {
                kind: record.kind,
                severity: EventSeverity::Fatal,
                recoverable: record.retryable,
                message: record.message.clone(),
                step: record.step.clone(),
            },
        );
        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::StateChanged {
                from: Some(from),
                to: SessionPhase::Failed,
            },
        );
        let report = validation_report_from(workflow, outputs);
        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::Completed {
                summary: CompletionSummary {
                    outcome: SessionPhase::Failed,
                    quality_score: report.as_ref().map(|r| r.score),
                    validation_status: report.as_ref().map(|r| r.status),
                    error: Some(record),
                },
            },
        );
        Ok(())
    }

    /// Cancellation observed: all in-flight invocations have terminated by
    /// the time the driver reaches here (cooperative contract).
    pub(crate) async fn finalize_cancelled(
        &self,
        mut session: Session,
    ) -> Result<(), OrchestratorError> {
        let from = session.phase;
        session.pending_input = None;
        session.transition(SessionPhase::Cancelled)?;
        let session = self.persist(session).await?;
        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::StateChanged {
                from: Some(from),
                to: SessionPhase::Cancelled,
            },
        );
        self.inner.bus.publish(
            &session.id,
            WorkflowEvent::Completed {
                summary: CompletionSummary {
                    outcome: SessionPhase::Cancelled,
                    quality_score: None,
                    validation_status: None,
                    error: None,
                },
            },
        );
        Ok(())
    }

    /// Suspension deadline expired without input.
    pub(crate) async fn fail_user_input_timeout(
        &self,
        session: Session,
    ) -> Result<(), OrchestratorError> {
        let workflow = self.workflow(&session.workflow).ok_or_else(|| {
            OrchestratorError::UnknownWorkflow {
                reference: session.workflow.clone(),
            }
        })?;
        let outputs = self
            .inner
            .checkpoints
            .latest_valid(&session.id)
            .await?
            .map(|cp| cp.outputs)
            .unwrap_or_default();
        let step = session.pending_input.as_ref().map(|p| p.step.clone());
        let record = ErrorRecord {
            kind: ErrorKind::UserInputTimeout,
            step,
            role: None,
            message: "suspension deadline expired before user input arrived".to_string(),
            fix_hint: None,
            correlation: session.correlation.clone(),
            retryable: false,
        };
        self.fail_session(session, record, &outputs, &workflow).await
    }

    /// Unexpected driver error: fail the session with an opaque record.
    async fn fail_internal(
        &self,
        id: &SessionId,
        err: &OrchestratorError,
    ) -> Result<(), OrchestratorError> {
        let session = self.load(id).await?;
        if session.phase.is_terminal() {
            return Ok(());
        }
        let workflow = self.workflow(&session.workflow).ok_or_else(|| {
            OrchestratorError::UnknownWorkflow {
                reference: session.workflow.clone(),
            }
        })?;
        let record = ErrorRecord {
            kind: err.kind(),
            step: None,
            role: None,
            message: err.to_string(),
            fix_hint: None,
            correlation: session.correlation.clone(),
            retryable: false,
        };
        self.fail_session(session, record, &StepOutputs::default(), &workflow)
            .await
    }

    /// Record the PROV-O activity for one completed step. Returns `true`
    /// when degraded-mode policy demands the workflow fail.
    async fn record_step_provenance(&self, session: &Session, step: &StepDefinition) -> bool {
        let attempts: Vec<AttemptSpan> = self
            .inner
            .dispatcher
            .invocations_for(&session.id)
            .iter()
            .filter(|record| record.step_id == step.id)
            .map(AttemptSpan::from)
            .collect();
        let started_at = attempts
            .first()
            .map(|a| a.started_at)
            .unwrap_or_else(Utc::now);
        let ended_at = attempts.last().map(|a| a.ended_at).unwrap_or_else(Utc::now);

        let mut attributes = rustc_hash::FxHashMap::default();
        attributes.insert("workflow".to_string(), session.workflow.clone());

        let activity = ActivityRecord {
            session_id: session.id.clone(),
            step_id: step.id.clone(),
            role: step.role,
            instance: self.inner.dispatcher.instance_for(step.role),
            started_at,
            ended_at,
            used: step.dependencies.clone(),
            generated_output: true,
            attempts,
            attributes,
        };

        match self.inner.provenance.record_activity(&activity).await {
            RecordOutcome::Recorded => false,
            RecordOutcome::Degraded {
                consecutive_failures,
                fatal,
            } => {
                self.inner.bus.publish(
                    &session.id,
                    WorkflowEvent::ProvenanceDegraded {
                        consecutive_failures,
                    },
                );
                fatal
            }
        }
    }
}

/// Resolve a stashed ambiguous detection against the user's format choice.
fn resolve_pending_detection(
    session: &mut Session,
    interfaces: &rustc_hash::FxHashMap<String, String>,
) -> Result<Option<Value>, OrchestratorError> {
    let Some(stashed) = session.metadata.get(PENDING_DETECTION_KEY).cloned() else {
        return Ok(None);
    };
    let Some(choice) = session
        .user_input
        .as_ref()
        .and_then(|input| input.get("format"))
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return Ok(None);
    };

    let detection: FormatDetection =
        serde_json::from_value(stashed).map_err(|e| OrchestratorError::Internal {
            correlation: session.correlation.clone(),
            message: format!("stashed detection is unreadable: {e}"),
        })?;
    let catalog = InterfaceCatalog::new(interfaces.clone());
    let resolved = detection.disambiguated(&choice, &catalog);

    session.metadata.remove(PENDING_DETECTION_KEY);
    session.user_input = None;
    Ok(Some(
        serde_json::to_value(&resolved).unwrap_or(Value::Null),
    ))
}

/// Next phase on the forward chain toward `Completed`.
fn forward_phase(phase: SessionPhase) -> Option<SessionPhase> {
    match phase {
        SessionPhase::Analyzing => Some(SessionPhase::CollectingMetadata),
        SessionPhase::CollectingMetadata => Some(SessionPhase::Converting),
        SessionPhase::Converting => Some(SessionPhase::Validating),
        SessionPhase::Validating => Some(SessionPhase::Completed),
        _ => None,
    }
}

/// The disambiguation prompt offered when detection is ambiguous.
fn disambiguation_schema(detection: &FormatDetection) -> PromptSchema {
    let choices: Vec<String> = detection.ranked.iter().map(|c| c.format.clone()).collect();
    let description = detection
        .ranked
        .iter()
        .map(|c| format!("{} (confidence {:.2})", c.format, c.confidence))
        .collect::<Vec<_>>()
        .join(", ");
    PromptSchema {
        id: "format-disambiguation".to_string(),
        title: "Multiple candidate formats detected".to_string(),
        fields: vec![PromptField {
            name: "format".to_string(),
            description,
            required: true,
            choices: Some(choices),
        }],
    }
}

/// Pull the aggregated validation report out of the output map, if the
/// workflow has a validation step that completed.
fn validation_report_from(
    workflow: &WorkflowDefinition,
    outputs: &StepOutputs,
) -> Option<ValidationReport> {
    workflow.order().iter().find_map(|step_id| {
        let step = workflow.step(step_id)?;
        if !step.is_validation {
            return None;
        }
        let value = outputs.get(step_id)?;
        serde_json::from_value(value.clone()).ok()
    })
}
