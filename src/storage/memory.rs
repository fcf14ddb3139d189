//! In-memory storage ports.
//!
//! Volatile process-local implementations used by the test suite and by
//! embedded single-process deployments. They honor the same contracts as
//! durable backends: version checks on persist, append-only checkpoints,
//! and digest verification on read.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::checkpoint::Checkpoint;
use crate::session::Session;
use crate::types::SessionId;

use super::{CheckpointStore, Result, SessionStore, StorageError};

/// Process-local session store.
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: RwLock<FxHashMap<SessionId, Session>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, mut session: Session) -> Result<Session> {
        let mut map = self.inner.write();
        if map.contains_key(&session.id) {
            return Err(StorageError::AlreadyExists {
                session_id: session.id,
            });
        }
        session.version = 1;
        map.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn load_latest(&self, id: &SessionId) -> Result<Session> {
        self.inner
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                session_id: id.clone(),
            })
    }

    async fn persist(&self, mut session: Session, expected_version: u64) -> Result<Session> {
        let mut map = self.inner.write();
        let current = map
            .get(&session.id)
            .ok_or_else(|| StorageError::NotFound {
                session_id: session.id.clone(),
            })?;
        if current.version != expected_version {
            return Err(StorageError::Conflict {
                session_id: session.id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }
        session.version = expected_version + 1;
        map.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn list(&self) -> Result<Vec<Session>> {
        Ok(self.inner.read().values().cloned().collect())
    }

    async fn purge(&self, id: &SessionId) -> Result<()> {
        self.inner.write().remove(id);
        Ok(())
    }
}

/// Process-local append-only checkpoint log.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<FxHashMap<SessionId, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints retained for a session (test observability).
    #[must_use]
    pub fn count(&self, id: &SessionId) -> usize {
        self.inner.read().get(id).map(Vec::len).unwrap_or(0)
    }

    /// Test helper: append a checkpoint without recomputing its digest,
    /// simulating a torn write reaching the log.
    #[doc(hidden)]
    pub fn append_raw(&self, checkpoint: Checkpoint) {
        self.inner
            .write()
            .entry(checkpoint.session_id.clone())
            .or_default()
            .push(checkpoint);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(&self, checkpoint: Checkpoint) -> Result<()> {
        self.inner
            .write()
            .entry(checkpoint.session_id.clone())
            .or_default()
            .push(checkpoint);
        Ok(())
    }

    async fn latest_valid(&self, id: &SessionId) -> Result<Option<Checkpoint>> {
        Ok(self
            .inner
            .read()
            .get(id)
            .and_then(|log| log.iter().rev().find(|cp| cp.verify()).cloned()))
    }

    async fn purge(&self, id: &SessionId) -> Result<()> {
        self.inner.write().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Principal, StepId};
    use crate::workflow::StepOutputs;
    use serde_json::json;

    fn session() -> Session {
        Session::new(
            Principal::new("alice"),
            "standard-conversion",
            json!({}),
            std::time::Duration::from_secs(3600),
            "cfg-1",
            1,
        )
    }

    #[tokio::test]
    async fn create_assigns_version_one_and_rejects_duplicates() {
        let store = InMemorySessionStore::new();
        let created = store.create(session()).await.unwrap();
        assert_eq!(created.version, 1);
        assert!(matches!(
            store.create(created.clone()).await,
            Err(StorageError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn persist_enforces_expected_version() {
        let store = InMemorySessionStore::new();
        let created = store.create(session()).await.unwrap();

        let v2 = store.persist(created.clone(), 1).await.unwrap();
        assert_eq!(v2.version, 2);

        // Stale writer loses.
        let err = store.persist(created, 1).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn latest_valid_skips_corrupt_checkpoints() {
        let store = InMemoryCheckpointStore::new();
        let id = SessionId::new("s1");

        let mut outputs = StepOutputs::default();
        outputs.insert(StepId::new("a"), json!(1));
        let good = Checkpoint::new(id.clone(), 2, outputs.clone(), vec![]);
        store.append(good.clone()).await.unwrap();

        outputs.insert(StepId::new("b"), json!(2));
        let torn = Checkpoint::new(id.clone(), 3, outputs, vec![]).corrupted();
        store.append_raw(torn);

        let recovered = store.latest_valid(&id).await.unwrap().unwrap();
        assert_eq!(recovered.version, 2);
        assert_eq!(recovered.digest(), good.digest());
    }
}
