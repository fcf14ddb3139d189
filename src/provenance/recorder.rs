//! Best-effort provenance recording with a degraded-mode policy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::config::ConfigHandle;
use crate::storage::Result;
use crate::types::SessionId;

use super::model::{ActivityRecord, Triple};
use super::ProvenanceStore;

/// What happened to one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Appended successfully; the consecutive-failure counter reset.
    Recorded,
    /// Append failed after bounded retries.
    Degraded {
        consecutive_failures: u32,
        /// Set when policy demands the workflow fail over lost provenance.
        fatal: bool,
    },
}

/// Appends activity records to the provenance store, absorbing transient
/// store failures up to the configured tolerance.
pub struct ProvenanceRecorder {
    store: Arc<dyn ProvenanceStore>,
    config: ConfigHandle,
    consecutive_failures: AtomicU32,
}

impl ProvenanceRecorder {
    #[must_use]
    pub fn new(store: Arc<dyn ProvenanceStore>, config: ConfigHandle) -> Self {
        Self {
            store,
            config,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Record one step activity.
    ///
    /// Failures are retried `provenance.retry_attempts` times; a persistent
    /// failure bumps the consecutive-failure counter and reports
    /// [`RecordOutcome::Degraded`], with `fatal` set once the counter
    /// crosses `degraded_after_failures` and the policy says to fail the
    /// workflow. The workflow itself never fails from inside the recorder.
    pub async fn record_activity(&self, activity: &ActivityRecord) -> RecordOutcome {
        let cfg = self.config.current().provenance.clone();
        let triples = activity.to_triples();

        let mut last_error = None;
        for _ in 0..=cfg.retry_attempts {
            match self
                .store
                .append(&activity.session_id, triples.clone())
                .await
            {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return RecordOutcome::Recorded;
                }
                Err(err) => last_error = Some(err),
            }
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            session = %activity.session_id,
            step = %activity.step_id,
            consecutive_failures = failures,
            error = ?last_error,
            "provenance append failed after bounded retries"
        );
        RecordOutcome::Degraded {
            consecutive_failures: failures,
            fatal: failures >= cfg.degraded_after_failures && cfg.fail_workflow_when_degraded,
        }
    }

    /// Stream the accumulated log for a session.
    pub async fn read(&self, session_id: &SessionId) -> Result<Vec<Triple>> {
        self.store.read(session_id).await
    }

    /// Co-delete provenance with its session.
    pub async fn purge(&self, session_id: &SessionId) -> Result<()> {
        self.store.purge(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::InMemoryProvenanceStore;
    use crate::storage::StorageError;
    use crate::types::{AgentRole, StepId};
    use async_trait::async_trait;
    use chrono::Utc;
    use rustc_hash::FxHashMap;

    struct FailingStore;

    #[async_trait]
    impl ProvenanceStore for FailingStore {
        async fn append(&self, _: &SessionId, _: Vec<Triple>) -> Result<()> {
            Err(StorageError::Backend {
                message: "disk full".into(),
            })
        }

        async fn read(&self, session_id: &SessionId) -> Result<Vec<Triple>> {
            Err(StorageError::NotFound {
                session_id: session_id.clone(),
            })
        }

        async fn purge(&self, _: &SessionId) -> Result<()> {
            Ok(())
        }
    }

    fn activity() -> ActivityRecord {
        ActivityRecord {
            session_id: SessionId::new("s1"),
            step_id: StepId::new("convert"),
            role: AgentRole::Conversion,
            instance: "default".into(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            used: vec![],
            generated_output: true,
            attempts: vec![],
            attributes: FxHashMap::default(),
        }
    }

    #[tokio::test]
    async fn successful_append_records_and_resets() {
        let recorder = ProvenanceRecorder::new(
            Arc::new(InMemoryProvenanceStore::new()),
            ConfigHandle::default(),
        );
        assert_eq!(
            recorder.record_activity(&activity()).await,
            RecordOutcome::Recorded
        );
        let triples = recorder.read(&SessionId::new("s1")).await.unwrap();
        assert!(!triples.is_empty());
    }

    #[tokio::test]
    async fn persistent_failure_degrades_then_turns_fatal() {
        let mut config = crate::config::OrchestratorConfig::default();
        config.provenance.degraded_after_failures = 2;
        config.provenance.fail_workflow_when_degraded = true;
        config.provenance.retry_attempts = 0;
        let recorder =
            ProvenanceRecorder::new(Arc::new(FailingStore), ConfigHandle::new(config));

        assert_eq!(
            recorder.record_activity(&activity()).await,
            RecordOutcome::Degraded {
                consecutive_failures: 1,
                fatal: false
            }
        );
        assert_eq!(
            recorder.record_activity(&activity()).await,
            RecordOutcome::Degraded {
                consecutive_failures: 2,
                fatal: true
            }
        );
    }
}
