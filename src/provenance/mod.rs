//! PROV-O provenance capture.
//!
//! Every step execution leaves a PROV-O trail: the session is a
//! `prov:Entity`, each step execution a `prov:Activity` with start and end
//! instants, each worker instance a `prov:SoftwareAgent`, inputs are
//! `prov:used`, outputs `prov:wasGeneratedBy`. Dispatch attempts appear as
//! nested attempt activities beneath their step activity so retries stay
//! visible in the audit trail.
//!
//! Records append to the [`ProvenanceStore`] port in insertion order and
//! serialize to Turtle (default) or JSON-LD with a pinned context; see
//! [`serialize`]. Identifiers are stable URNs derived from session and
//! invocation ids, so re-serializing a log yields an isomorphic graph.
//!
//! Provenance is best-effort up to a configured threshold: append failures
//! retry a bounded number of times and then surface as a
//! `ProvenanceDegraded` event; only past
//! `provenance.degraded_after_failures` (and only when the policy says so)
//! does the workflow itself fail.

mod model;
mod recorder;
pub mod serialize;

pub use model::{ActivityRecord, AttemptSpan, ProvObject, Triple};
pub use recorder::{ProvenanceRecorder, RecordOutcome};

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::storage::{Result, StorageError};
use crate::types::SessionId;

/// Append-only triple log, streamed back in insertion order.
#[async_trait]
pub trait ProvenanceStore: Send + Sync {
    async fn append(&self, session_id: &SessionId, triples: Vec<Triple>) -> Result<()>;

    async fn read(&self, session_id: &SessionId) -> Result<Vec<Triple>>;

    /// Provenance is co-deleted with its session on purge.
    async fn purge(&self, session_id: &SessionId) -> Result<()>;
}

/// Process-local provenance store.
#[derive(Default)]
pub struct InMemoryProvenanceStore {
    inner: RwLock<FxHashMap<SessionId, Vec<Triple>>>,
}

impl InMemoryProvenanceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProvenanceStore for InMemoryProvenanceStore {
    async fn append(&self, session_id: &SessionId, triples: Vec<Triple>) -> Result<()> {
        self.inner
            .write()
            .entry(session_id.clone())
            .or_default()
            .extend(triples);
        Ok(())
    }

    async fn read(&self, session_id: &SessionId) -> Result<Vec<Triple>> {
        self.inner
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                session_id: session_id.clone(),
            })
    }

    async fn purge(&self, session_id: &SessionId) -> Result<()> {
        self.inner.write().remove(session_id);
        Ok(())
    }
}
