//! Transport adapters: thin protocol skins over the orchestration API.
//!
//! Three adapters expose the same contract -- stdio-framed tool calls
//! ([`stdio`]), HTTP/REST ([`http`]), and WebSocket ([`ws`]). They contain
//! no workflow logic: each translates protocol frames into
//! [`WorkflowEngine`](crate::engine::WorkflowEngine) calls and event-bus
//! subscriptions, and frames the results back. For identical inputs the
//! adapters produce semantically equivalent outputs modulo framing; the
//! shared contract tests in `tests/adapters.rs` hold them to it.

pub mod http;
pub mod stdio;
pub mod ws;

use serde_json::{json, Value};

use crate::errors::OrchestratorError;

/// The uniform error payload shared by every transport.
pub(crate) fn error_body(err: &OrchestratorError) -> Value {
    json!({
        "error": {
            "kind": err.kind().as_str(),
            "message": err.to_string(),
            "retryable": err.retryable(),
        }
    })
}
