//! Storage ports consumed by the orchestration core.
//!
//! The core never talks to a database or filesystem directly: sessions,
//! checkpoints, and provenance go through the async port traits defined
//! here, and production deployments bind real backends at startup. The
//! in-memory implementations in [`memory`] back the test suite and small
//! single-process deployments.
//!
//! Contracts the core relies on:
//!
//! - `SessionStore::persist` enforces optimistic concurrency: the stored
//!   version must equal `expected_version` or the call fails with
//!   [`StorageError::Conflict`]. The engine serializes mutations through a
//!   per-session lock, so a conflict reaching a caller indicates a defect.
//! - `CheckpointStore::append` is atomic (stage + fsync + rename for file
//!   backends); `latest_valid` verifies integrity digests on read and
//!   silently skips corrupt entries.
//! - All ports provide linearizable operations on a single session id.

pub mod memory;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::checkpoint::Checkpoint;
use crate::session::Session;
use crate::types::SessionId;

pub use memory::{InMemoryCheckpointStore, InMemorySessionStore};

/// Errors surfaced by storage ports.
#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    /// No record exists for the session.
    #[error("session not found in store: {session_id}")]
    #[diagnostic(code(nwbflow::storage::not_found))]
    NotFound { session_id: SessionId },

    /// A session with this id already exists.
    #[error("session already exists: {session_id}")]
    #[diagnostic(code(nwbflow::storage::already_exists))]
    AlreadyExists { session_id: SessionId },

    /// Optimistic concurrency check failed.
    #[error("version conflict on {session_id}: expected v{expected}, found v{actual}")]
    #[diagnostic(
        code(nwbflow::storage::conflict),
        help("The session was persisted concurrently; reload and retry under the session lock.")
    )]
    Conflict {
        session_id: SessionId,
        expected: u64,
        actual: u64,
    },

    /// Backend failure (database, filesystem, network).
    #[error("storage backend error: {message}")]
    #[diagnostic(code(nwbflow::storage::backend))]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable home of [`Session`] records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a brand new session at version 1.
    async fn create(&self, session: Session) -> Result<Session>;

    /// Load the most recently persisted snapshot.
    async fn load_latest(&self, id: &SessionId) -> Result<Session>;

    /// Persist a mutated session, enforcing `expected_version`.
    ///
    /// On success the stored (and returned) session carries
    /// `expected_version + 1`.
    async fn persist(&self, session: Session, expected_version: u64) -> Result<Session>;

    /// All sessions not yet purged, in unspecified order.
    async fn list(&self) -> Result<Vec<Session>>;

    /// Remove a session entirely. Idempotent.
    async fn purge(&self, id: &SessionId) -> Result<()>;
}

/// Append-only checkpoint log per session.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Atomically append a checkpoint.
    async fn append(&self, checkpoint: Checkpoint) -> Result<()>;

    /// The newest checkpoint whose integrity digest verifies, if any.
    async fn latest_valid(&self, id: &SessionId) -> Result<Option<Checkpoint>>;

    /// Drop all checkpoints for a session. Idempotent.
    async fn purge(&self, id: &SessionId) -> Result<()>;
}
