//! Fluent construction of workflow definitions.

use super::definition::{WorkflowDefinition, WorkflowError};
use super::step::StepDefinition;

/// Builder for [`WorkflowDefinition`] with a fluent API.
///
/// Collects steps and validates the whole graph on
/// [`build`](Self::build); nothing is checked incrementally, so steps may
/// be added in any order regardless of their dependencies.
///
/// # Examples
///
/// ```rust
/// use nwbflow::types::AgentRole;
/// use nwbflow::workflow::{StepDefinition, WorkflowBuilder};
///
/// let workflow = WorkflowBuilder::new("two-stage")
///     .add_step(StepDefinition::new("convert", AgentRole::Conversion))
///     .add_step(
///         StepDefinition::new("validate", AgentRole::Evaluation)
///             .depends_on(["convert"]),
///     )
///     .build()
///     .unwrap();
/// assert_eq!(workflow.len(), 2);
/// ```
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<StepDefinition>,
}

impl WorkflowBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Add one step. Duplicate ids are rejected at build time.
    #[must_use]
    pub fn add_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Validate the collected graph and freeze it into an immutable
    /// definition.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::Empty`] when no steps were added
    /// - [`WorkflowError::DuplicateStep`] on id collisions
    /// - [`WorkflowError::UnknownDependency`] for dangling edges
    /// - [`WorkflowError::CircularDependency`] when the graph has a cycle
    pub fn build(self) -> Result<WorkflowDefinition, WorkflowError> {
        WorkflowDefinition::assemble(self.name, self.steps)
    }
}
