//! Core identifier and role types for the nwbflow orchestration core.
//!
//! This module defines the fundamental identifiers used throughout the
//! system for naming sessions, workflow steps, dispatch attempts, and the
//! worker roles that execute them. These are the core domain concepts that
//! define what a conversion workflow *is*.
//!
//! For runtime execution types (checkpoints, event sequences), see
//! [`crate::checkpoint`] and [`crate::event_bus`].
//!
//! # Key Types
//!
//! - [`AgentRole`]: The four external worker capabilities plus `Internal`
//! - [`SessionId`]: Opaque, URL-safe, 128-bit random session identifier
//! - [`StepId`]: Identifies one node of a workflow DAG; ordered for
//!   deterministic scheduling tie-breaks
//!
//! # Examples
//!
//! ```rust
//! use nwbflow::types::{AgentRole, SessionId, StepId};
//!
//! let id = SessionId::generate();
//! assert_eq!(id.as_str().len(), 32);
//!
//! let role = AgentRole::parse("Conversion").unwrap();
//! assert_eq!(role.encode(), "Conversion");
//!
//! let detect = StepId::new("detect-format");
//! assert!(detect < StepId::new("validate"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The worker capability a workflow step is executed by.
///
/// The orchestration core never sees worker internals; the role tag is used
/// for dispatch routing, circuit-breaker bucketing, and per-role concurrency
/// caps. `Internal` marks steps evaluated inside the core itself (for
/// example the format-detection coordination step).
///
/// # Persistence
///
/// `AgentRole` supports serialization for checkpointing through both serde
/// and the [`encode`](Self::encode)/[`parse`](Self::parse) string forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentRole {
    /// Conversational front-end worker driving user-facing dialogue.
    Conversation,
    /// Worker that formulates metadata questions and collects answers.
    MetadataQuestioner,
    /// Worker that performs the actual data conversion.
    Conversion,
    /// Worker that runs validators over conversion artifacts.
    Evaluation,
    /// Steps evaluated inside the orchestrator, never dispatched externally.
    Internal,
}

impl AgentRole {
    /// All roles, in declaration order. Used for catalog iteration and
    /// per-role resource setup.
    pub const ALL: [AgentRole; 5] = [
        AgentRole::Conversation,
        AgentRole::MetadataQuestioner,
        AgentRole::Conversion,
        AgentRole::Evaluation,
        AgentRole::Internal,
    ];

    /// Encode the role into its persisted string form.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            AgentRole::Conversation => "Conversation",
            AgentRole::MetadataQuestioner => "MetadataQuestioner",
            AgentRole::Conversion => "Conversion",
            AgentRole::Evaluation => "Evaluation",
            AgentRole::Internal => "Internal",
        }
    }

    /// Parse a persisted or wire string form back into a role.
    ///
    /// Returns `None` for unrecognized tags; callers decide whether that is
    /// an `InvalidWorkflow` (submit-time) or a deserialization defect.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Conversation" => Some(AgentRole::Conversation),
            "MetadataQuestioner" => Some(AgentRole::MetadataQuestioner),
            "Conversion" => Some(AgentRole::Conversion),
            "Evaluation" => Some(AgentRole::Evaluation),
            "Internal" => Some(AgentRole::Internal),
            _ => None,
        }
    }

    /// Returns `true` when steps with this role are dispatched to an
    /// external worker through the agent port.
    #[must_use]
    pub fn is_external(&self) -> bool {
        !matches!(self, AgentRole::Internal)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Generate a fresh random identifier (128-bit, URL-safe hex).
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().simple().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id! {
    /// Opaque session identifier.
    ///
    /// Generated as 128 random bits rendered URL-safe; globally unique and
    /// never reused. Sessions are only ever addressed by this handle --
    /// checkpoints and events reference the id, never the session object.
    SessionId
}

opaque_id! {
    /// Identifier of one step within a workflow definition.
    ///
    /// Ordering is total and lexicographic; the scheduler relies on it for
    /// deterministic tie-breaking when several steps become ready at once.
    StepId
}

opaque_id! {
    /// Identifier of a single dispatch attempt to a worker.
    InvocationId
}

opaque_id! {
    /// Correlation identifier propagated to workers for distributed tracing.
    ///
    /// One correlation id spans a whole session; span ids nest beneath it
    /// per workflow -> step -> attempt.
    CorrelationId
}

opaque_id! {
    /// Tracing span identifier for a single step attempt.
    SpanId
}

opaque_id! {
    /// Pre-validated principal identifier owning a session.
    ///
    /// Identity resolution happens outside the core; by the time a request
    /// reaches the engine the principal is already authenticated.
    Principal
}
