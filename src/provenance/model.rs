//! Triple model and IRI scheme.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::dispatch::{InvocationOutcome, InvocationRecord};
use crate::types::{AgentRole, SessionId, StepId};

pub const PROV_NS: &str = "http://www.w3.org/ns/prov#";
pub const XSD_DATETIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";
pub const NWBFLOW_NS: &str = "urn:nwbflow:vocab:";

/// Object position of a triple: another node or a literal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProvObject {
    Iri(String),
    Literal {
        value: String,
        datatype: Option<String>,
    },
}

impl ProvObject {
    pub fn iri(value: impl Into<String>) -> Self {
        ProvObject::Iri(value.into())
    }

    pub fn string(value: impl Into<String>) -> Self {
        ProvObject::Literal {
            value: value.into(),
            datatype: None,
        }
    }

    pub fn datetime(value: DateTime<Utc>) -> Self {
        ProvObject::Literal {
            value: value.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            datatype: Some(XSD_DATETIME.to_string()),
        }
    }
}

/// One RDF triple with fully expanded IRIs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: ProvObject,
}

impl Triple {
    pub fn new(subject: impl Into<String>, predicate: impl Into<String>, object: ProvObject) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object,
        }
    }
}

/// Stable IRI constructors; all provenance identity derives from these.
#[must_use]
pub fn session_iri(session_id: &SessionId) -> String {
    format!("urn:nwbflow:session:{session_id}")
}

#[must_use]
pub fn activity_iri(session_id: &SessionId, step_id: &StepId) -> String {
    format!("urn:nwbflow:activity:{session_id}:{step_id}")
}

#[must_use]
pub fn attempt_iri(session_id: &SessionId, step_id: &StepId, attempt: u32) -> String {
    format!("urn:nwbflow:activity:{session_id}:{step_id}:attempt-{attempt}")
}

#[must_use]
pub fn agent_iri(role: AgentRole, instance: &str) -> String {
    format!("urn:nwbflow:agent:{}:{instance}", role.encode())
}

#[must_use]
pub fn entity_iri(session_id: &SessionId, step_id: &StepId) -> String {
    format!("urn:nwbflow:entity:{session_id}:{step_id}:output")
}

fn prov(term: &str) -> String {
    format!("{PROV_NS}{term}")
}

fn vocab(term: &str) -> String {
    format!("{NWBFLOW_NS}{term}")
}

const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

/// One dispatch attempt, nested beneath a step activity.
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptSpan {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: String,
}

impl From<&InvocationRecord> for AttemptSpan {
    fn from(record: &InvocationRecord) -> Self {
        let outcome = match &record.outcome {
            InvocationOutcome::Ok => "ok".to_string(),
            InvocationOutcome::InputRequired => "input-required".to_string(),
            InvocationOutcome::Timeout => "timeout".to_string(),
            InvocationOutcome::RetryableFailure { reason } => format!("retryable: {reason}"),
            InvocationOutcome::PermanentFailure { reason } => format!("permanent: {reason}"),
            InvocationOutcome::Cancelled => "cancelled".to_string(),
        };
        Self {
            attempt: record.attempt,
            started_at: record.started_at,
            ended_at: record.ended_at,
            outcome,
        }
    }
}

/// Everything recorded about one step execution.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivityRecord {
    pub session_id: SessionId,
    pub step_id: StepId,
    pub role: AgentRole,
    pub instance: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Step ids whose outputs this activity consumed.
    pub used: Vec<StepId>,
    /// Whether this activity generated an output entity.
    pub generated_output: bool,
    pub attempts: Vec<AttemptSpan>,
    pub attributes: FxHashMap<String, String>,
}

impl ActivityRecord {
    /// Expand into PROV-O triples, deterministically ordered.
    #[must_use]
    pub fn to_triples(&self) -> Vec<Triple> {
        let session = session_iri(&self.session_id);
        let activity = activity_iri(&self.session_id, &self.step_id);
        let agent = agent_iri(self.role, &self.instance);

        let mut triples = vec![
            Triple::new(session.as_str(), RDF_TYPE, ProvObject::iri(prov("Entity"))),
            Triple::new(activity.as_str(), RDF_TYPE, ProvObject::iri(prov("Activity"))),
            Triple::new(agent.as_str(), RDF_TYPE, ProvObject::iri(prov("SoftwareAgent"))),
            Triple::new(
                activity.as_str(),
                prov("wasAssociatedWith"),
                ProvObject::iri(agent.as_str()),
            ),
            Triple::new(
                activity.as_str(),
                prov("startedAtTime"),
                ProvObject::datetime(self.started_at),
            ),
            Triple::new(
                activity.as_str(),
                prov("endedAtTime"),
                ProvObject::datetime(self.ended_at),
            ),
            Triple::new(activity.as_str(), vocab("step"), ProvObject::string(self.step_id.as_str())),
            Triple::new(activity.as_str(), vocab("role"), ProvObject::string(self.role.encode())),
        ];

        for input in &self.used {
            triples.push(Triple::new(
                activity.as_str(),
                prov("used"),
                ProvObject::iri(entity_iri(&self.session_id, input)),
            ));
        }

        if self.generated_output {
            let output = entity_iri(&self.session_id, &self.step_id);
            triples.push(Triple::new(output.as_str(), RDF_TYPE, ProvObject::iri(prov("Entity"))));
            triples.push(Triple::new(
                output.as_str(),
                prov("wasGeneratedBy"),
                ProvObject::iri(activity.as_str()),
            ));
        }

        for span in &self.attempts {
            let attempt = attempt_iri(&self.session_id, &self.step_id, span.attempt);
            triples.push(Triple::new(attempt.as_str(), RDF_TYPE, ProvObject::iri(prov("Activity"))));
            triples.push(Triple::new(
                attempt.as_str(),
                vocab("attemptOf"),
                ProvObject::iri(activity.as_str()),
            ));
            triples.push(Triple::new(
                attempt.as_str(),
                prov("startedAtTime"),
                ProvObject::datetime(span.started_at),
            ));
            triples.push(Triple::new(
                attempt.as_str(),
                prov("endedAtTime"),
                ProvObject::datetime(span.ended_at),
            ));
            triples.push(Triple::new(
                attempt.as_str(),
                vocab("outcome"),
                ProvObject::string(span.outcome.as_str()),
            ));
        }

        let mut attribute_keys: Vec<&String> = self.attributes.keys().collect();
        attribute_keys.sort();
        for key in attribute_keys {
            triples.push(Triple::new(
                activity.as_str(),
                vocab(key),
                ProvObject::string(self.attributes[key].as_str()),
            ));
        }

        triples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triples_cover_the_prov_core_shape() {
        let record = ActivityRecord {
            session_id: SessionId::new("s1"),
            step_id: StepId::new("convert"),
            role: AgentRole::Conversion,
            instance: "default".into(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            used: vec![StepId::new("collect-metadata")],
            generated_output: true,
            attempts: vec![AttemptSpan {
                attempt: 1,
                started_at: Utc::now(),
                ended_at: Utc::now(),
                outcome: "ok".into(),
            }],
            attributes: FxHashMap::default(),
        };

        let triples = record.to_triples();
        let has = |p: &str| triples.iter().any(|t| t.predicate.ends_with(p));
        assert!(has("wasAssociatedWith"));
        assert!(has("startedAtTime"));
        assert!(has("endedAtTime"));
        assert!(has("used"));
        assert!(has("wasGeneratedBy"));
        assert!(has("attemptOf"));
    }

    #[test]
    fn iris_are_stable_functions_of_their_inputs() {
        let s = SessionId::new("abc");
        let step = StepId::new("convert");
        assert_eq!(activity_iri(&s, &step), "urn:nwbflow:activity:abc:convert");
        assert_eq!(attempt_iri(&s, &step, 2), "urn:nwbflow:activity:abc:convert:attempt-2");
        assert_eq!(agent_iri(AgentRole::Evaluation, "v1"), "urn:nwbflow:agent:Evaluation:v1");
    }
}
