//! The canonical four-stage conversion workflow.

use std::time::Duration;

use serde_json::json;

use crate::types::AgentRole;

use super::builder::WorkflowBuilder;
use super::definition::WorkflowDefinition;
use super::step::StepDefinition;

/// Name under which adapters resolve the default workflow.
pub const STANDARD_WORKFLOW: &str = "standard-conversion";

/// Build the standard detect -> collect-metadata -> convert -> validate
/// pipeline.
///
/// Registered at orchestrator startup; custom pipelines are registered the
/// same way (no dynamic plugin loading). The step ids double as output keys
/// in checkpoints and provenance entity names, so they are stable strings.
#[must_use]
pub fn standard_conversion_workflow() -> WorkflowDefinition {
    WorkflowBuilder::new(STANDARD_WORKFLOW)
        .add_step(
            StepDefinition::new("detect-format", AgentRole::Conversation)
                .detection()
                .with_input(|inputs| json!({ "dataset": inputs.dataset })),
        )
        .add_step(
            StepDefinition::new("collect-metadata", AgentRole::MetadataQuestioner)
                .suspendable()
                .depends_on(["detect-format"])
                .with_input(|inputs| {
                    let mut payload = json!({
                        "dataset": inputs.dataset,
                        "detection": inputs.outputs
                            .get(&crate::types::StepId::new("detect-format"))
                            .cloned()
                            .unwrap_or(serde_json::Value::Null),
                    });
                    if let Some(user) = inputs.user_input {
                        payload["user_input"] = user.clone();
                    }
                    payload
                }),
        )
        .add_step(
            StepDefinition::new("convert", AgentRole::Conversion)
                .with_timeout(Duration::from_secs(600))
                .depends_on(["collect-metadata"]),
        )
        .add_step(
            StepDefinition::new("validate", AgentRole::Evaluation)
                .validation()
                .depends_on(["convert"]),
        )
        .build()
        .expect("standard workflow is statically acyclic")
}
