//! Immutable workflow DAGs and their structural validation.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

use crate::types::StepId;

use super::step::StepDefinition;

/// Structural defects detected while building a workflow.
///
/// All of these are rejected at `submit` time as `InvalidWorkflow`; a
/// definition that builds successfully can always be scheduled.
#[derive(Debug, Error, Diagnostic)]
pub enum WorkflowError {
    /// The dependency graph contains a cycle.
    #[error("workflow {workflow} contains a dependency cycle through {through}")]
    #[diagnostic(
        code(nwbflow::workflow::circular_dependency),
        help("Every step must be reachable from a source step without revisiting itself.")
    )]
    CircularDependency { workflow: String, through: StepId },

    /// Two steps share the same id.
    #[error("duplicate step id {step} in workflow {workflow}")]
    #[diagnostic(code(nwbflow::workflow::duplicate_step))]
    DuplicateStep { workflow: String, step: StepId },

    /// A step depends on an id that is not part of the workflow.
    #[error("step {step} depends on unknown step {dependency}")]
    #[diagnostic(
        code(nwbflow::workflow::unknown_dependency),
        help("Dependencies must name steps added to the same workflow.")
    )]
    UnknownDependency { step: StepId, dependency: StepId },

    /// The workflow has no steps at all.
    #[error("workflow {workflow} has no steps")]
    #[diagnostic(code(nwbflow::workflow::empty))]
    Empty { workflow: String },

    /// A wire payload referenced an agent role tag the core does not know.
    #[error("unknown agent role tag: {role}")]
    #[diagnostic(code(nwbflow::workflow::unknown_role))]
    UnknownRole { role: String },
}

/// An immutable, validated DAG of conversion steps.
///
/// Built once (usually at orchestrator startup), then shared across every
/// session that references it. The definition owns the deterministic
/// topological order used for scheduling tie-breaks.
#[derive(Clone)]
pub struct WorkflowDefinition {
    name: String,
    steps: FxHashMap<StepId, Arc<StepDefinition>>,
    dependents: FxHashMap<StepId, Vec<StepId>>,
    sources: Vec<StepId>,
    order: Vec<StepId>,
}

impl WorkflowDefinition {
    pub(super) fn assemble(
        name: String,
        step_list: Vec<StepDefinition>,
    ) -> Result<Self, WorkflowError> {
        if step_list.is_empty() {
            return Err(WorkflowError::Empty { workflow: name });
        }

        let mut steps: FxHashMap<StepId, Arc<StepDefinition>> = FxHashMap::default();
        for step in step_list {
            if steps.contains_key(&step.id) {
                return Err(WorkflowError::DuplicateStep {
                    workflow: name,
                    step: step.id,
                });
            }
            steps.insert(step.id.clone(), Arc::new(step));
        }

        let mut dependents: FxHashMap<StepId, Vec<StepId>> = FxHashMap::default();
        for step in steps.values() {
            for dep in &step.dependencies {
                if !steps.contains_key(dep) {
                    return Err(WorkflowError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents.entry(dep.clone()).or_default().push(step.id.clone());
            }
        }
        for children in dependents.values_mut() {
            children.sort();
        }

        let order = topological_order(&steps, &dependents);
        if order.len() != steps.len() {
            // Kahn's algorithm leaves cycle members unordered; report one.
            let through = steps
                .keys()
                .find(|id| !order.contains(id))
                .cloned()
                .unwrap_or_else(|| StepId::new("unknown"));
            return Err(WorkflowError::CircularDependency {
                workflow: name,
                through,
            });
        }

        let mut sources: Vec<StepId> = steps
            .values()
            .filter(|s| s.dependencies.is_empty())
            .map(|s| s.id.clone())
            .collect();
        sources.sort();

        Ok(Self {
            name,
            steps,
            dependents,
            sources,
            order,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps with no dependencies; the initial execution frontier.
    #[must_use]
    pub fn sources(&self) -> &[StepId] {
        &self.sources
    }

    /// Deterministic topological ordering (dependencies first, lexicographic
    /// tie-break).
    #[must_use]
    pub fn order(&self) -> &[StepId] {
        &self.order
    }

    #[must_use]
    pub fn step(&self, id: &StepId) -> Option<&Arc<StepDefinition>> {
        self.steps.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Children that list `id` among their dependencies.
    #[must_use]
    pub fn dependents(&self, id: &StepId) -> &[StepId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Steps whose dependencies are all present in `produced` but whose own
    /// output is still missing. Sorted by step id for deterministic
    /// scheduling.
    #[must_use]
    pub fn ready_steps(
        &self,
        produced: &rustc_hash::FxHashMap<StepId, serde_json::Value>,
    ) -> Vec<StepId> {
        let mut ready: Vec<StepId> = self
            .steps
            .values()
            .filter(|step| {
                !produced.contains_key(&step.id)
                    && step.dependencies.iter().all(|d| produced.contains_key(d))
            })
            .map(|step| step.id.clone())
            .collect();
        ready.sort();
        ready
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("steps", &self.order)
            .finish()
    }
}

/// Kahn's algorithm over the dependency graph.
///
/// Ties are broken lexicographically so the resulting order is stable
/// across runs and platforms.
fn topological_order(
    steps: &FxHashMap<StepId, Arc<StepDefinition>>,
    dependents: &FxHashMap<StepId, Vec<StepId>>,
) -> Vec<StepId> {
    let mut in_degree: FxHashMap<StepId, usize> = steps
        .values()
        .map(|s| (s.id.clone(), s.dependencies.len()))
        .collect();

    let mut zero: Vec<StepId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| id.clone())
        .collect();
    zero.sort();

    let mut queue: VecDeque<StepId> = zero.into();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        let mut unlocked = Vec::new();
        for child in dependents.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(deg) = in_degree.get_mut(child) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    unlocked.push(child.clone());
                }
            }
        }
        unlocked.sort();
        queue.extend(unlocked);
    }

    order
}
