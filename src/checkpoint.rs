//! Durable snapshots of workflow progress.
//!
//! A checkpoint captures the step-output map and the execution frontier of
//! a session at one persisted version. Checkpoints are append-only and
//! carry a SHA-256 integrity digest over a canonical serialization; a
//! checkpoint whose digest fails verification is treated as absent and the
//! previous valid one is used instead (torn-write tolerance for filesystem
//! backends that stage + fsync + rename).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{SessionId, StepId};
use crate::workflow::StepOutputs;

/// A durable snapshot taken after each step completion and before each
/// suspension.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: SessionId,
    /// Session version at which this checkpoint was taken.
    pub version: u64,
    /// Outputs of every completed step.
    pub outputs: StepOutputs,
    /// Steps eligible to run next.
    pub frontier: Vec<StepId>,
    pub taken_at: DateTime<Utc>,
    /// Hex SHA-256 over the canonical payload encoding.
    digest: String,
}

impl Checkpoint {
    #[must_use]
    pub fn new(
        session_id: SessionId,
        version: u64,
        outputs: StepOutputs,
        mut frontier: Vec<StepId>,
    ) -> Self {
        frontier.sort();
        let digest = compute_digest(&session_id, version, &outputs, &frontier);
        Self {
            session_id,
            version,
            outputs,
            frontier,
            taken_at: Utc::now(),
            digest,
        }
    }

    /// Recompute the digest and compare against the stored one.
    ///
    /// Readers must call this before trusting a loaded checkpoint; stores
    /// do it on behalf of callers in `latest_valid`.
    #[must_use]
    pub fn verify(&self) -> bool {
        compute_digest(&self.session_id, self.version, &self.outputs, &self.frontier)
            == self.digest
    }

    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Test helper: produce a copy whose digest no longer matches.
    #[doc(hidden)]
    #[must_use]
    pub fn corrupted(mut self) -> Self {
        self.digest = "0".repeat(64);
        self
    }
}

/// Canonical encoding: step outputs sorted by id, frontier pre-sorted, all
/// joined with explicit separators so field boundaries cannot alias.
fn compute_digest(
    session_id: &SessionId,
    version: u64,
    outputs: &StepOutputs,
    frontier: &[StepId],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(version.to_be_bytes());
    let mut keys: Vec<&StepId> = outputs.keys().collect();
    keys.sort();
    for key in keys {
        hasher.update(b"\x1f");
        hasher.update(key.as_str().as_bytes());
        hasher.update(b"\x1e");
        hasher.update(canonical_json(&outputs[key]).as_bytes());
    }
    for step in frontier {
        hasher.update(b"\x1d");
        hasher.update(step.as_str().as_bytes());
    }
    hex(&hasher.finalize())
}

/// Deterministic JSON rendering: object keys sorted recursively.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
