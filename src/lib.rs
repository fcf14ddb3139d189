//! # nwbflow: Conversion Orchestration Core
//!
//! nwbflow drives long-running neurodata conversion workflows -- format
//! detection, interactive metadata collection, conversion, ensemble
//! validation -- by dispatching steps to four external worker roles while
//! owning everything stateful: durable sessions with a checkpointed state
//! machine, resilient agent dispatch, PROV-O provenance, and ordered
//! per-session event streams exposed identically over stdio, HTTP, and
//! WebSocket transports.
//!
//! ## Core Concepts
//!
//! - **Workflow**: an immutable DAG of steps, each tagged with the agent
//!   role that executes it ([`workflow`])
//! - **Session**: one end-to-end conversion attempt walking a validated
//!   state machine ([`session`])
//! - **Checkpoint**: a durable, integrity-hashed snapshot of step outputs
//!   and the execution frontier ([`checkpoint`])
//! - **Dispatcher**: timeout/retry/circuit-breaker/dedup wrapper around
//!   the abstract worker port ([`dispatch`])
//! - **Engine**: the DAG scheduler composing all of the above ([`engine`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nwbflow::dispatch::{AgentPort, AgentReply, AgentRequest, AgentError};
//! use nwbflow::engine::{WorkflowEngineBuilder, STANDARD_WORKFLOW};
//! use nwbflow::types::Principal;
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//!
//! struct WorkerFleet;
//!
//! #[async_trait]
//! impl AgentPort for WorkerFleet {
//!     async fn invoke(
//!         &self,
//!         request: AgentRequest,
//!         _deadline: std::time::Duration,
//!         _cancel: CancellationToken,
//!     ) -> Result<AgentReply, AgentError> {
//!         // Route `request.role` to the real worker transport here.
//!         Ok(AgentReply::Ok(serde_json::json!({ "echo": request.payload })))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = WorkflowEngineBuilder::new(Arc::new(WorkerFleet)).build();
//! let session = engine
//!     .submit(
//!         STANDARD_WORKFLOW,
//!         serde_json::json!({ "path": "/data/session-17" }),
//!         Principal::new("lab-7"),
//!     )
//!     .await?;
//! let snapshot = engine.status(&session).await?;
//! println!("phase: {}", snapshot.phase);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`types`] - identifiers and the agent-role vocabulary
//! - [`errors`] - the error taxonomy shared across transports
//! - [`config`] - hierarchical, hot-reloadable configuration
//! - [`workflow`] - DAG definitions, validation, the standard pipeline
//! - [`session`] - the session state machine and prompts
//! - [`checkpoint`] / [`storage`] - durable snapshots and storage ports
//! - [`dispatch`] - the resilient agent dispatcher
//! - [`detection`] / [`validation`] - pure coordination components
//! - [`provenance`] - PROV-O recording and serialization
//! - [`event_bus`] - ordered per-session event streaming
//! - [`engine`] - the workflow engine
//! - [`adapters`] - stdio, HTTP, and WebSocket transports

pub mod adapters;
pub mod checkpoint;
pub mod config;
pub mod detection;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod event_bus;
pub mod provenance;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod validation;
pub mod workflow;
