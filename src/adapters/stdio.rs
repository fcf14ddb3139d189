//! Stdio-framed tool adapter.
//!
//! Newline-delimited JSON frames. Requests:
//! `{"tool": <name>, "args": <object>, "id": <string>}`. Responses:
//! `{"id": ..., "result": ...}` or `{"id": ..., "error": {"kind", "message",
//! "retryable"}}`. The `subscribeEvents` tool additionally emits one
//! `{"id": ..., "event": ...}` frame per event until the session reaches a
//! terminal event, then closes the call with a final result frame.
//!
//! Tool names map 1:1 to the orchestration API: `submit`, `status`,
//! `resume`, `cancel`, `provideInput`, `validateStandalone`,
//! `listSessions`, `provenance`, `subscribeEvents`.
//!
//! [`StdioAdapter::run`] serves stdin/stdout and returns on EOF; hosts map
//! that to exit code 0 (non-zero is reserved for startup failures in the
//! embedding binary). Diagnostics go to stderr via `tracing`, keeping the
//! frame channel clean.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::engine::{WorkflowEngine, STANDARD_WORKFLOW};
use crate::errors::OrchestratorError;
use crate::event_bus::SubscribeFrom;
use crate::provenance::serialize;
use crate::types::{CorrelationId, Principal, SessionId};

use super::error_body;

#[derive(Debug, Deserialize)]
struct Frame {
    tool: String,
    #[serde(default)]
    args: Value,
    id: String,
}

/// What a tool call produced.
#[derive(Debug)]
pub enum ToolReply {
    /// Single result payload.
    Value(Value),
    /// A live event stream; the adapter pumps it into event frames.
    Events(crate::event_bus::EventSubscription),
}

/// The stdio transport.
pub struct StdioAdapter {
    engine: WorkflowEngine,
}

impl StdioAdapter {
    #[must_use]
    pub fn new(engine: WorkflowEngine) -> Self {
        Self { engine }
    }

    /// Serve stdin/stdout until EOF.
    pub async fn run(&self) -> std::io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve arbitrary byte streams (tests drive this directly).
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let frame: Frame = match serde_json::from_str(&line) {
                Ok(frame) => frame,
                Err(err) => {
                    let response = json!({
                        "id": extract_id(&line),
                        "error": {
                            "kind": "Internal",
                            "message": format!("malformed frame: {err}"),
                            "retryable": false,
                        }
                    });
                    write_frame(&writer, &response).await?;
                    continue;
                }
            };

            match self.handle(&frame.tool, &frame.args).await {
                Ok(ToolReply::Value(result)) => {
                    let response = json!({ "id": frame.id, "result": result });
                    write_frame(&writer, &response).await?;
                }
                Ok(ToolReply::Events(mut subscription)) => {
                    // Pump events concurrently so other tool calls keep
                    // flowing while the stream is live.
                    let writer = writer.clone();
                    let id = frame.id.clone();
                    tokio::spawn(async move {
                        while let Ok(event) = subscription.recv().await {
                            let terminal = event.event.is_terminal();
                            let frame = json!({
                                "id": id,
                                "event": event,
                            });
                            if write_frame(&writer, &frame).await.is_err() {
                                return;
                            }
                            if terminal {
                                break;
                            }
                        }
                        let done = json!({ "id": id, "result": { "done": true } });
                        let _ = write_frame(&writer, &done).await;
                    });
                }
                Err(err) => {
                    let mut response = error_body(&err);
                    response["id"] = Value::String(frame.id);
                    write_frame(&writer, &response).await?;
                }
            }
        }
        Ok(())
    }

    /// Execute one tool call against the engine.
    pub async fn handle(&self, tool: &str, args: &Value) -> Result<ToolReply, OrchestratorError> {
        match tool {
            "submit" => {
                let workflow = args
                    .get("workflow")
                    .and_then(Value::as_str)
                    .unwrap_or(STANDARD_WORKFLOW);
                let dataset = args.get("dataset").cloned().unwrap_or(Value::Null);
                let principal = Principal::new(
                    args.get("principal").and_then(Value::as_str).unwrap_or(""),
                );
                let session_id = self.engine.submit(workflow, dataset, principal).await?;
                Ok(ToolReply::Value(json!({ "sessionId": session_id })))
            }
            "status" => {
                let snapshot = self.engine.status(&session_arg(args)?).await?;
                Ok(ToolReply::Value(
                    serde_json::to_value(snapshot).unwrap_or(Value::Null),
                ))
            }
            "resume" => {
                self.engine.resume(&session_arg(args)?).await?;
                Ok(ToolReply::Value(json!({ "acknowledged": true })))
            }
            "cancel" => {
                self.engine.cancel(&session_arg(args)?).await?;
                Ok(ToolReply::Value(json!({ "acknowledged": true })))
            }
            "provideInput" => {
                let input = args.get("input").cloned().unwrap_or(Value::Null);
                self.engine
                    .provide_input(&session_arg(args)?, input)
                    .await?;
                Ok(ToolReply::Value(json!({ "acknowledged": true })))
            }
            "validateStandalone" => {
                let file = args.get("file").cloned().unwrap_or(Value::Null);
                let validators = args
                    .get("validators")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let report = self.engine.validate_standalone(file, validators).await?;
                Ok(ToolReply::Value(
                    serde_json::to_value(report).unwrap_or(Value::Null),
                ))
            }
            "listSessions" => {
                let principal = args
                    .get("principal")
                    .and_then(Value::as_str)
                    .map(Principal::new);
                let sessions = self.engine.list_sessions(principal.as_ref()).await?;
                Ok(ToolReply::Value(json!({ "sessions": sessions })))
            }
            "provenance" => {
                let triples = self.engine.provenance(&session_arg(args)?).await?;
                let format = args
                    .get("format")
                    .and_then(Value::as_str)
                    .unwrap_or("turtle");
                let result = if format.eq_ignore_ascii_case("jsonld") {
                    json!({ "format": "jsonld", "document": serialize::to_jsonld(&triples) })
                } else {
                    json!({ "format": "turtle", "document": serialize::to_turtle(&triples) })
                };
                Ok(ToolReply::Value(result))
            }
            "subscribeEvents" => {
                let from = match args.get("startSeq").and_then(Value::as_u64) {
                    Some(seq) => SubscribeFrom::Seq(seq),
                    None => SubscribeFrom::Latest,
                };
                let subscription = self.engine.subscribe(&session_arg(args)?, from).await?;
                Ok(ToolReply::Events(subscription))
            }
            other => Err(OrchestratorError::Internal {
                correlation: CorrelationId::generate(),
                message: format!("unknown tool: {other}"),
            }),
        }
    }
}

fn session_arg(args: &Value) -> Result<SessionId, OrchestratorError> {
    args.get("sessionId")
        .and_then(Value::as_str)
        .map(SessionId::new)
        .ok_or_else(|| OrchestratorError::NotFound {
            session_id: SessionId::new("missing"),
        })
}

async fn write_frame<W>(writer: &Arc<Mutex<W>>, frame: &Value) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut guard = writer.lock().await;
    let mut line = frame.to_string();
    line.push('\n');
    guard.write_all(line.as_bytes()).await?;
    guard.flush().await
}

/// Best-effort recovery of the frame id from an unparseable line.
fn extract_id(line: &str) -> Value {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .unwrap_or(Value::Null)
}
