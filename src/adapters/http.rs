//! HTTP/REST adapter.
//!
//! Route table (axum):
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | POST | `/api/v1/conversions` | submit (202) |
//! | GET | `/api/v1/conversions` | list sessions |
//! | GET | `/api/v1/conversions/{id}` | status |
//! | POST | `/api/v1/conversions/{id}/resume` | resume |
//! | DELETE | `/api/v1/conversions/{id}` | cancel |
//! | POST | `/api/v1/conversions/{id}/input` | provide input |
//! | GET | `/api/v1/conversions/{id}/provenance` | PROV-O stream (Accept negotiation) |
//! | POST | `/api/v1/validations` | standalone validation |
//!
//! Error payloads are `{"error": {"kind", "message", "retryable"}}` with
//! the status-code mapping documented on [`status_for`].

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{WorkflowEngine, STANDARD_WORKFLOW};
use crate::errors::{ErrorKind, OrchestratorError};
use crate::provenance::serialize;
use crate::types::{Principal, SessionId};

use super::error_body;

/// Build the REST router. Merge with [`super::ws::router`] for the full
/// HTTP surface.
#[must_use]
pub fn router(engine: WorkflowEngine) -> Router {
    Router::new()
        .route("/api/v1/conversions", post(submit).get(list_sessions))
        .route("/api/v1/conversions/{id}", get(status).delete(cancel))
        .route("/api/v1/conversions/{id}/resume", post(resume))
        .route("/api/v1/conversions/{id}/input", post(provide_input))
        .route("/api/v1/conversions/{id}/provenance", get(provenance))
        .route("/api/v1/validations", post(validate))
        .with_state(engine)
}

/// HTTP status for each error kind.
///
/// 400 client defects, 401 unauthorized, 404 unknown resources, 409
/// terminal-state and concurrency conflicts, 422 schema mismatches, 503
/// circuit-open/overload, 500 everything internal.
#[must_use]
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidWorkflow => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidStateTransition
        | ErrorKind::TerminalState
        | ErrorKind::NotSuspended
        | ErrorKind::ConcurrencyError => StatusCode::CONFLICT,
        ErrorKind::InputSchemaMismatch => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::CircuitOpen | ErrorKind::ValidatorUnavailable | ErrorKind::Timeout => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        (status, Json(error_body(&self.0))).into_response()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    #[serde(default)]
    workflow: Option<String>,
    dataset: Value,
    principal: String,
}

async fn submit(
    State(engine): State<WorkflowEngine>,
    Json(body): Json<SubmitBody>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow = body.workflow.as_deref().unwrap_or(STANDARD_WORKFLOW);
    let session_id = engine
        .submit(workflow, body.dataset, Principal::new(body.principal))
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "sessionId": session_id })),
    ))
}

#[derive(Deserialize)]
struct ListQuery {
    principal: Option<String>,
}

async fn list_sessions(
    State(engine): State<WorkflowEngine>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = query.principal.map(Principal::new);
    let sessions = engine.list_sessions(principal.as_ref()).await?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn status(
    State(engine): State<WorkflowEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = engine.status(&SessionId::new(id)).await?;
    Ok(Json(serde_json::to_value(snapshot).unwrap_or(Value::Null)))
}

async fn resume(
    State(engine): State<WorkflowEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    engine.resume(&SessionId::new(id)).await?;
    Ok(Json(json!({ "acknowledged": true })))
}

async fn cancel(
    State(engine): State<WorkflowEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    engine.cancel(&SessionId::new(id)).await?;
    Ok(Json(json!({ "acknowledged": true })))
}

async fn provide_input(
    State(engine): State<WorkflowEngine>,
    Path(id): Path<String>,
    Json(input): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    engine.provide_input(&SessionId::new(id), input).await?;
    Ok(Json(json!({ "acknowledged": true })))
}

async fn provenance(
    State(engine): State<WorkflowEngine>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let triples = engine.provenance(&SessionId::new(id)).await?;
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("text/turtle");

    if accept.contains("application/ld+json") {
        let doc = serialize::to_jsonld(&triples);
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/ld+json")],
            Json(doc),
        )
            .into_response())
    } else {
        let doc = serialize::to_turtle(&triples);
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/turtle")],
            doc,
        )
            .into_response())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateBody {
    file: Value,
    #[serde(default)]
    validators: Vec<String>,
}

async fn validate(
    State(engine): State<WorkflowEngine>,
    Json(body): Json<ValidateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let report = engine
        .validate_standalone(body.file, body.validators)
        .await?;
    Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null)))
}
