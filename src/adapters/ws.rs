//! WebSocket adapter.
//!
//! A connection binds to one session id
//! (`GET /api/v1/conversions/{id}/events`, upgraded). Messages are JSON
//! objects tagged by `type`:
//!
//! - client -> server: `subscribe {startSeq?}`, `unsubscribe`,
//!   `provideInput {input}`, `queryState`, `ping`
//! - server -> client: `subscribed {currentState, latestSeq}`,
//!   `progressUpdate`, `statusChange`, `inputRequired`, `error`,
//!   `completed`, `pong`, `stateSnapshot`
//!
//! Heartbeat: the server pings every 30 s and closes with 1001 when the
//! client stays silent past the 10 s grace. Close codes: 1000 normal,
//! 1001 timeout, 1011 server error, 4004 session not found, 4429
//! subscriber overflow (rate-limited).

use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tracing::debug;

use crate::engine::WorkflowEngine;
use crate::errors::{ErrorKind, OrchestratorError};
use crate::event_bus::{
    EventSubscription, SequencedEvent, SubscribeFrom, SubscriptionEnd, WorkflowEvent,
};
use crate::types::SessionId;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_TIMEOUT: u16 = 1001;
pub const CLOSE_SERVER_ERROR: u16 = 1011;
pub const CLOSE_NOT_FOUND: u16 = 4004;
pub const CLOSE_RATE_LIMITED: u16 = 4429;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_GRACE: Duration = Duration::from_secs(10);

/// Build the WebSocket router; merge with the REST router for the full
/// HTTP surface.
#[must_use]
pub fn router(engine: WorkflowEngine) -> Router {
    Router::new()
        .route("/api/v1/conversions/{id}/events", get(upgrade))
        .with_state(engine)
}

async fn upgrade(
    State(engine): State<WorkflowEngine>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| connection(engine, SessionId::new(id), socket))
}

/// Translate a workflow event into the server message vocabulary.
///
/// Exposed so the cross-adapter contract tests can assert frame shapes
/// without opening a socket.
#[must_use]
pub fn server_frame(event: &SequencedEvent) -> Value {
    let kind = match &event.event {
        WorkflowEvent::StepStarted { .. }
        | WorkflowEvent::StepProgress { .. }
        | WorkflowEvent::StepCompleted { .. } => "progressUpdate",
        WorkflowEvent::StateChanged { .. } | WorkflowEvent::ConfigChanged { .. } => "statusChange",
        WorkflowEvent::InputRequired { .. } => "inputRequired",
        WorkflowEvent::ErrorRaised { .. } | WorkflowEvent::ProvenanceDegraded { .. } => "error",
        WorkflowEvent::Completed { .. } => "completed",
    };
    json!({
        "type": kind,
        "seq": event.seq,
        "at": event.at,
        "payload": event,
    })
}

async fn connection(engine: WorkflowEngine, session_id: SessionId, mut socket: WebSocket) {
    // Bind to the session up front; unknown ids close immediately.
    if engine.status(&session_id).await.is_err() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_NOT_FOUND,
                reason: "session not found".into(),
            })))
            .await;
        return;
    }

    let mut subscription: Option<EventSubscription> = None;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                last_seen = Instant::now();
                match message {
                    Message::Text(text) => {
                        match handle_client_text(&engine, &session_id, text.as_str(), &mut subscription).await {
                            ClientAction::Reply(frames) => {
                                for frame in frames {
                                    if send_json(&mut socket, &frame).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            ClientAction::Close(code, reason) => {
                                let _ = socket.send(Message::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.into(),
                                }))).await;
                                return;
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        let frame = error_frame(&OrchestratorError::Internal {
                            correlation: crate::types::CorrelationId::generate(),
                            message: "binary frames are not part of this protocol".to_string(),
                        });
                        if send_json(&mut socket, &frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
            event = next_event(&mut subscription), if subscription.is_some() => {
                match event {
                    Some(Ok(event)) => {
                        if send_json(&mut socket, &server_frame(&event)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(SubscriptionEnd::Overflowed)) => {
                        let frame = json!({
                            "type": "error",
                            "error": {
                                "kind": ErrorKind::SubscriberOverflow.as_str(),
                                "message": "subscriber fell behind on critical events",
                                "retryable": true,
                            }
                        });
                        let _ = send_json(&mut socket, &frame).await;
                        let _ = socket.send(Message::Close(Some(CloseFrame {
                            code: CLOSE_RATE_LIMITED,
                            reason: "subscriber overflow".into(),
                        }))).await;
                        return;
                    }
                    Some(Err(SubscriptionEnd::Closed)) | None => {
                        subscription = None;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > HEARTBEAT_INTERVAL + HEARTBEAT_GRACE {
                    let _ = socket.send(Message::Close(Some(CloseFrame {
                        code: CLOSE_TIMEOUT,
                        reason: "heartbeat timeout".into(),
                    }))).await;
                    return;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        }
    }

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_NORMAL,
            reason: "bye".into(),
        })))
        .await;
}

async fn send_json(socket: &mut WebSocket, frame: &Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(frame.to_string().into())).await
}

async fn next_event(
    subscription: &mut Option<EventSubscription>,
) -> Option<Result<SequencedEvent, SubscriptionEnd>> {
    match subscription.as_mut() {
        Some(sub) => Some(sub.recv().await),
        None => futures_util::future::pending().await,
    }
}

enum ClientAction {
    Reply(Vec<Value>),
    Close(u16, String),
}

async fn handle_client_text(
    engine: &WorkflowEngine,
    session_id: &SessionId,
    text: &str,
    subscription: &mut Option<EventSubscription>,
) -> ClientAction {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return ClientAction::Reply(vec![json!({
            "type": "error",
            "error": { "kind": "Internal", "message": "malformed message", "retryable": false }
        })]);
    };

    match message.get("type").and_then(Value::as_str) {
        Some("subscribe") => {
            let from = match message.get("startSeq").and_then(Value::as_u64) {
                Some(seq) => SubscribeFrom::Seq(seq),
                None => SubscribeFrom::Latest,
            };
            match engine.subscribe(session_id, from).await {
                Ok(sub) => {
                    *subscription = Some(sub);
                    match engine.status(session_id).await {
                        Ok(snapshot) => ClientAction::Reply(vec![json!({
                            "type": "subscribed",
                            "currentState": snapshot.phase,
                            "latestSeq": snapshot.latest_seq,
                        })]),
                        Err(err) => ClientAction::Reply(vec![error_frame(&err)]),
                    }
                }
                Err(err) => ClientAction::Reply(vec![error_frame(&err)]),
            }
        }
        Some("unsubscribe") => {
            *subscription = None;
            ClientAction::Reply(vec![json!({ "type": "statusChange", "unsubscribed": true })])
        }
        Some("provideInput") => {
            let input = message.get("input").cloned().unwrap_or(Value::Null);
            match engine.provide_input(session_id, input).await {
                Ok(()) => ClientAction::Reply(vec![json!({
                    "type": "statusChange",
                    "acknowledged": true,
                })]),
                Err(err) => ClientAction::Reply(vec![error_frame(&err)]),
            }
        }
        Some("queryState") => match engine.status(session_id).await {
            Ok(snapshot) => ClientAction::Reply(vec![json!({
                "type": "stateSnapshot",
                "snapshot": snapshot,
            })]),
            Err(err) => ClientAction::Reply(vec![error_frame(&err)]),
        },
        Some("ping") => ClientAction::Reply(vec![json!({ "type": "pong" })]),
        other => {
            debug!(message_type = ?other, "unknown websocket message type");
            ClientAction::Reply(vec![json!({
                "type": "error",
                "error": {
                    "kind": "Internal",
                    "message": format!("unknown message type: {other:?}"),
                    "retryable": false,
                }
            })])
        }
    }
}

/// Uniform error message frame.
#[must_use]
pub fn error_frame(err: &OrchestratorError) -> Value {
    let mut body = super::error_body(err);
    body["type"] = Value::String("error".to_string());
    body
}
