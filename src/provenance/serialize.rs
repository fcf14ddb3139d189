//! Streaming serialization of provenance triples.
//!
//! Turtle output is deterministic: subjects are grouped and emitted in
//! first-appearance order (the append order of the underlying log), with
//! predicates and objects sorted within each subject block. Known
//! namespaces collapse to prefixed names. JSON-LD uses a pinned `@context`
//! so consumers can rely on term meanings across releases.

use serde_json::{json, Map, Value};

use super::model::{ProvObject, Triple, NWBFLOW_NS, PROV_NS};

const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema#";

/// Render a triple log as a Turtle document.
#[must_use]
pub fn to_turtle(triples: &[Triple]) -> String {
    let mut out = String::new();
    out.push_str("@prefix prov: <http://www.w3.org/ns/prov#> .\n");
    out.push_str("@prefix rdf: <http://www.w3.org/1999/02/22-rdf-syntax-ns#> .\n");
    out.push_str("@prefix xsd: <http://www.w3.org/2001/XMLSchema#> .\n");
    out.push_str("@prefix nwb: <urn:nwbflow:vocab:> .\n\n");

    for (subject, mut entries) in group_by_subject(triples) {
        entries.sort();
        out.push_str(&format!("<{subject}>\n"));
        let last = entries.len() - 1;
        for (index, (predicate, object)) in entries.iter().enumerate() {
            let terminator = if index == last { " .\n" } else { " ;\n" };
            out.push_str(&format!(
                "    {} {}{terminator}",
                shorten(predicate),
                render_object(object)
            ));
        }
        out.push('\n');
    }
    out
}

/// Render a triple log as JSON-LD with the pinned context.
#[must_use]
pub fn to_jsonld(triples: &[Triple]) -> Value {
    let mut graph = Vec::new();
    for (subject, mut entries) in group_by_subject(triples) {
        entries.sort();
        let mut node = Map::new();
        node.insert("@id".to_string(), Value::String(subject));
        for (predicate, object) in entries {
            let key = shorten(&predicate);
            let rendered = match object {
                ProvObject::Iri(iri) => json!({ "@id": iri }),
                ProvObject::Literal {
                    value,
                    datatype: Some(dt),
                } => json!({ "@value": value, "@type": shorten(&dt) }),
                ProvObject::Literal {
                    value,
                    datatype: None,
                } => Value::String(value),
            };
            match node.get_mut(&key) {
                Some(Value::Array(existing)) => existing.push(rendered),
                Some(existing) => {
                    let previous = existing.take();
                    *existing = Value::Array(vec![previous, rendered]);
                }
                None => {
                    node.insert(key, rendered);
                }
            }
        }
        graph.push(Value::Object(node));
    }

    json!({
        "@context": {
            "prov": PROV_NS,
            "rdf": RDF_NS,
            "xsd": XSD_NS,
            "nwb": NWBFLOW_NS,
        },
        "@graph": graph,
    })
}

/// Group triples by subject, preserving first-appearance order.
fn group_by_subject(triples: &[Triple]) -> Vec<(String, Vec<(String, ProvObject)>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: rustc_hash::FxHashMap<String, Vec<(String, ProvObject)>> =
        rustc_hash::FxHashMap::default();
    for triple in triples {
        if !groups.contains_key(&triple.subject) {
            order.push(triple.subject.clone());
        }
        let entry = groups.entry(triple.subject.clone()).or_default();
        let pair = (triple.predicate.clone(), triple.object.clone());
        if !entry.contains(&pair) {
            entry.push(pair);
        }
    }
    order
        .into_iter()
        .map(|subject| {
            let entries = groups.remove(&subject).unwrap_or_default();
            (subject, entries)
        })
        .collect()
}

fn shorten(iri: &str) -> String {
    if let Some(rest) = iri.strip_prefix(PROV_NS) {
        format!("prov:{rest}")
    } else if let Some(rest) = iri.strip_prefix(RDF_NS) {
        format!("rdf:{rest}")
    } else if let Some(rest) = iri.strip_prefix(XSD_NS) {
        format!("xsd:{rest}")
    } else if let Some(rest) = iri.strip_prefix(NWBFLOW_NS) {
        format!("nwb:{rest}")
    } else {
        format!("<{iri}>")
    }
}

fn render_object(object: &ProvObject) -> String {
    match object {
        ProvObject::Iri(iri) => shorten(iri),
        ProvObject::Literal { value, datatype } => {
            let escaped = escape_literal(value);
            match datatype {
                Some(dt) => format!("\"{escaped}\"^^{}", shorten(dt)),
                None => format!("\"{escaped}\""),
            }
        }
    }
}

fn escape_literal(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::model::{ActivityRecord, AttemptSpan};
    use crate::types::{AgentRole, SessionId, StepId};
    use chrono::Utc;
    use rustc_hash::FxHashMap;

    fn triples() -> Vec<Triple> {
        ActivityRecord {
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
        }
        .to_triples()
    }

    #[test]
    fn turtle_contains_prefixes_and_prov_terms() {
        let doc = to_turtle(&triples());
        assert!(doc.starts_with("@prefix prov:"));
        assert!(doc.contains("prov:wasAssociatedWith"));
        assert!(doc.contains("prov:startedAtTime"));
        assert!(doc.contains("^^xsd:dateTime"));
        assert!(doc.contains("<urn:nwbflow:activity:s1:convert>"));
        assert!(doc.trim_end().ends_with('.'));
    }

    #[test]
    fn turtle_is_deterministic_for_identical_input() {
        let ts = triples();
        assert_eq!(to_turtle(&ts), to_turtle(&ts));
    }

    #[test]
    fn duplicate_triples_collapse() {
        let mut ts = triples();
        let duplicated = ts[0].clone();
        ts.push(duplicated);
        let doc = to_turtle(&ts);
        assert_eq!(doc.matches("rdf:type prov:Entity").count(), 2); // session + output entity
    }

    #[test]
    fn jsonld_pins_the_context() {
        let doc = to_jsonld(&triples());
        assert_eq!(doc["@context"]["prov"], PROV_NS);
        assert_eq!(doc["@context"]["nwb"], NWBFLOW_NS);
        let graph = doc["@graph"].as_array().unwrap();
        assert!(graph
            .iter()
            .any(|node| node["@id"] == "urn:nwbflow:activity:s1:convert"));
    }

    #[test]
    fn literals_escape_quotes_and_newlines() {
        let triple = Triple::new(
            "urn:nwbflow:activity:x:y",
            format!("{NWBFLOW_NS}outcome"),
            ProvObject::string("said \"no\"\nand left"),
        );
        let doc = to_turtle(&[triple]);
        assert!(doc.contains("\\\"no\\\""));
        assert!(doc.contains("\\n"));
    }
}
