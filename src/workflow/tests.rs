use serde_json::json;

use crate::types::{AgentRole, StepId};

use super::*;

fn step(id: &str, role: AgentRole) -> StepDefinition {
    StepDefinition::new(id, role)
}

#[test]
fn linear_workflow_orders_dependencies_first() {
    let wf = WorkflowBuilder::new("linear")
        .add_step(step("b", AgentRole::Conversion).depends_on(["a"]))
        .add_step(step("a", AgentRole::Conversation))
        .add_step(step("c", AgentRole::Evaluation).depends_on(["b"]))
        .build()
        .unwrap();

    assert_eq!(
        wf.order(),
        &[StepId::new("a"), StepId::new("b"), StepId::new("c")]
    );
    assert_eq!(wf.sources(), &[StepId::new("a")]);
}

#[test]
fn diamond_breaks_ties_lexicographically() {
    let wf = WorkflowBuilder::new("diamond")
        .add_step(step("root", AgentRole::Conversation))
        .add_step(step("left", AgentRole::Conversion).depends_on(["root"]))
        .add_step(step("right", AgentRole::Conversion).depends_on(["root"]))
        .add_step(step("join", AgentRole::Evaluation).depends_on(["left", "right"]))
        .build()
        .unwrap();

    let order = wf.order();
    assert_eq!(order[0], StepId::new("root"));
    assert_eq!(order[1], StepId::new("left"));
    assert_eq!(order[2], StepId::new("right"));
    assert_eq!(order[3], StepId::new("join"));
}

#[test]
fn cycle_is_rejected() {
    let err = WorkflowBuilder::new("cyclic")
        .add_step(step("a", AgentRole::Conversion).depends_on(["b"]))
        .add_step(step("b", AgentRole::Conversion).depends_on(["a"]))
        .build()
        .unwrap_err();

    assert!(matches!(err, WorkflowError::CircularDependency { .. }));
}

#[test]
fn self_loop_is_a_cycle() {
    let err = WorkflowBuilder::new("self")
        .add_step(step("a", AgentRole::Conversion).depends_on(["a"]))
        .build()
        .unwrap_err();

    assert!(matches!(err, WorkflowError::CircularDependency { .. }));
}

#[test]
fn dangling_dependency_is_rejected() {
    let err = WorkflowBuilder::new("dangling")
        .add_step(step("a", AgentRole::Conversion).depends_on(["ghost"]))
        .build()
        .unwrap_err();

    assert!(matches!(
        err,
        WorkflowError::UnknownDependency { dependency, .. } if dependency == StepId::new("ghost")
    ));
}

#[test]
fn duplicate_step_is_rejected() {
    let err = WorkflowBuilder::new("dup")
        .add_step(step("a", AgentRole::Conversion))
        .add_step(step("a", AgentRole::Evaluation))
        .build()
        .unwrap_err();

    assert!(matches!(err, WorkflowError::DuplicateStep { .. }));
}

#[test]
fn empty_workflow_is_rejected() {
    let err = WorkflowBuilder::new("void").build().unwrap_err();
    assert!(matches!(err, WorkflowError::Empty { .. }));
}

#[test]
fn ready_steps_track_produced_outputs() {
    let wf = standard_conversion_workflow();

    let mut produced = StepOutputs::default();
    assert_eq!(wf.ready_steps(&produced), vec![StepId::new("detect-format")]);

    produced.insert(StepId::new("detect-format"), json!({"format": "SpikeGLX"}));
    assert_eq!(
        wf.ready_steps(&produced),
        vec![StepId::new("collect-metadata")]
    );

    produced.insert(StepId::new("collect-metadata"), json!({}));
    produced.insert(StepId::new("convert"), json!({"artifact": "out.nwb"}));
    assert_eq!(wf.ready_steps(&produced), vec![StepId::new("validate")]);

    produced.insert(StepId::new("validate"), json!({}));
    assert!(wf.ready_steps(&produced).is_empty());
}

#[test]
fn default_input_builder_includes_upstream_outputs() {
    let s = step("convert", AgentRole::Conversion);
    let dataset = json!({"path": "/data/session-1"});
    let mut outputs = StepOutputs::default();
    outputs.insert(StepId::new("detect-format"), json!({"format": "SpikeGLX"}));

    let payload = s.build_input(&StepInputs {
        dataset: &dataset,
        outputs: &outputs,
        user_input: None,
    });

    assert_eq!(payload["dataset"]["path"], "/data/session-1");
    assert_eq!(payload["upstream"]["detect-format"]["format"], "SpikeGLX");
    assert!(payload.get("user_input").is_none());
}
