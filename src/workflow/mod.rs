//! Workflow definition and validation for conversion pipelines.
//!
//! A workflow is an immutable directed acyclic graph of [`StepDefinition`]s.
//! Each step names the agent role that executes it, its timeout and retry
//! policy, whether it may suspend awaiting user input, and a pure function
//! from prior-step outputs to its request payload. Edges declare
//! dependencies; a step becomes *ready* once every dependency has produced
//! an output.
//!
//! Construction goes through [`WorkflowBuilder`], which validates the graph
//! on [`build`](WorkflowBuilder::build): cycles fail with
//! [`WorkflowError::CircularDependency`], dangling dependencies with
//! [`WorkflowError::UnknownDependency`]. A successfully built
//! [`WorkflowDefinition`] is immutable and can be shared across sessions.
//!
//! # Quick Start
//!
//! ```rust
//! use nwbflow::types::{AgentRole, StepId};
//! use nwbflow::workflow::{StepDefinition, WorkflowBuilder};
//!
//! let workflow = WorkflowBuilder::new("convert-recording")
//!     .add_step(StepDefinition::new("detect-format", AgentRole::Internal).detection())
//!     .add_step(
//!         StepDefinition::new("collect-metadata", AgentRole::MetadataQuestioner)
//!             .suspendable()
//!             .depends_on(["detect-format"]),
//!     )
//!     .add_step(StepDefinition::new("convert", AgentRole::Conversion).depends_on(["collect-metadata"]))
//!     .add_step(
//!         StepDefinition::new("validate", AgentRole::Evaluation)
//!             .validation()
//!             .depends_on(["convert"]),
//!     )
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(workflow.sources(), &[StepId::new("detect-format")]);
//! ```

mod builder;
mod catalog;
mod definition;
mod step;

#[cfg(test)]
mod tests;

pub use builder::WorkflowBuilder;
pub use catalog::{standard_conversion_workflow, STANDARD_WORKFLOW};
pub use definition::{WorkflowDefinition, WorkflowError};
pub use step::{StepDefinition, StepInputs, StepOutputs};
