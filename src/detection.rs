//! Format detection coordination.
//!
//! Detector workers contribute `(format tag, confidence, evidence)` tuples;
//! this pure component aggregates them into a [`FormatDetection`]:
//! authority-weighted confidence sums clipped to [0, 1], a deterministic
//! lexicographic tie-break, and an ambiguity verdict when the top two
//! candidates sit within the configured threshold of each other. An
//! ambiguous detection makes the engine raise `InputRequired` so the user
//! can disambiguate.
//!
//! The mapping from a chosen format to a conversion interface is a static
//! catalog supplied through configuration, not code.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// One detector's contribution for one candidate format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorContribution {
    pub format: String,
    /// Confidence in [0, 1]; values outside are clamped during aggregation.
    pub confidence: f64,
    pub evidence: String,
    /// Detector-declared authority weight, defaulting to 1.0.
    #[serde(default = "default_authority")]
    pub authority: f64,
}

fn default_authority() -> f64 {
    1.0
}

/// A candidate format after aggregation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormatCandidate {
    pub format: String,
    /// Aggregated confidence, clipped to [0, 1].
    pub confidence: f64,
    /// Evidence strings from every contributing detector, in input order.
    pub evidence: Vec<String>,
}

/// Result of coordinating all detector contributions for a dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormatDetection {
    /// Candidates ordered by (confidence descending, format ascending).
    pub ranked: Vec<FormatCandidate>,
    /// Winning format tag, absent when no detector contributed.
    pub primary: Option<String>,
    /// Conversion interface mapped from the primary format.
    pub interface: Option<String>,
    /// Set when the top two candidates are within the ambiguity threshold;
    /// the engine then requests user disambiguation.
    pub ambiguous: bool,
    /// Non-primary format tags, ranked.
    pub alternatives: Vec<String>,
}

impl FormatDetection {
    /// Re-resolve the detection after the user picked `format`.
    #[must_use]
    pub fn disambiguated(mut self, format: &str, catalog: &InterfaceCatalog) -> Self {
        self.primary = Some(format.to_string());
        self.interface = catalog.interface_for(format);
        self.ambiguous = false;
        self.alternatives = self
            .ranked
            .iter()
            .map(|c| c.format.clone())
            .filter(|f| f != format)
            .collect();
        self
    }
}

/// Static format -> conversion-interface mapping.
///
/// Populated from configuration at startup; unknown formats simply map to
/// no interface, which downstream steps treat as "no automated converter".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceCatalog {
    entries: FxHashMap<String, String>,
}

impl InterfaceCatalog {
    #[must_use]
    pub fn new(entries: FxHashMap<String, String>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn interface_for(&self, format: &str) -> Option<String> {
        self.entries.get(format).cloned()
    }
}

/// Aggregate detector contributions into a [`FormatDetection`].
///
/// A detection is ambiguous when `top1 - top2 <= ambiguity_threshold`;
/// only a gap strictly greater than the threshold is unambiguous.
#[must_use]
pub fn coordinate(
    contributions: &[DetectorContribution],
    catalog: &InterfaceCatalog,
    ambiguity_threshold: f64,
) -> FormatDetection {
    let mut scores: FxHashMap<String, f64> = FxHashMap::default();
    let mut evidence: FxHashMap<String, Vec<String>> = FxHashMap::default();

    for c in contributions {
        let weighted = c.confidence.clamp(0.0, 1.0) * c.authority.max(0.0);
        *scores.entry(c.format.clone()).or_insert(0.0) += weighted;
        if !c.evidence.is_empty() {
            evidence.entry(c.format.clone()).or_default().push(c.evidence.clone());
        }
    }

    let mut ranked: Vec<FormatCandidate> = scores
        .into_iter()
        .map(|(format, score)| FormatCandidate {
            evidence: evidence.remove(&format).unwrap_or_default(),
            confidence: score.clamp(0.0, 1.0),
            format,
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.format.cmp(&b.format))
    });

    let primary = ranked.first().map(|c| c.format.clone());
    let ambiguous = match (ranked.first(), ranked.get(1)) {
        (Some(top), Some(runner_up)) => top.confidence - runner_up.confidence <= ambiguity_threshold,
        _ => false,
    };
    let interface = primary.as_deref().and_then(|f| catalog.interface_for(f));
    let alternatives = ranked.iter().skip(1).map(|c| c.format.clone()).collect();

    FormatDetection {
        ranked,
        primary,
        interface,
        ambiguous,
        alternatives,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(format: &str, confidence: f64) -> DetectorContribution {
        DetectorContribution {
            format: format.into(),
            confidence,
            evidence: format!("{format} markers present"),
            authority: 1.0,
        }
    }

    fn catalog() -> InterfaceCatalog {
        let mut entries = FxHashMap::default();
        entries.insert("SpikeGLX".to_string(), "spikeglx-recording".to_string());
        entries.insert("OpenEphys".to_string(), "openephys-recording".to_string());
        InterfaceCatalog::new(entries)
    }

    #[test]
    fn confident_single_candidate_maps_to_interface() {
        let detection = coordinate(&[contribution("SpikeGLX", 0.97)], &catalog(), 0.05);
        assert_eq!(detection.primary.as_deref(), Some("SpikeGLX"));
        assert_eq!(detection.interface.as_deref(), Some("spikeglx-recording"));
        assert!(!detection.ambiguous);
        assert!(detection.alternatives.is_empty());
    }

    #[test]
    fn near_tie_is_ambiguous() {
        let detection = coordinate(
            &[contribution("SpikeGLX", 0.52), contribution("OpenEphys", 0.50)],
            &catalog(),
            0.05,
        );
        assert!(detection.ambiguous);
        assert_eq!(detection.primary.as_deref(), Some("SpikeGLX"));
        assert_eq!(detection.alternatives, vec!["OpenEphys".to_string()]);
    }

    #[test]
    fn ambiguity_boundary_is_inclusive_of_the_threshold() {
        let at_threshold = coordinate(
            &[contribution("A", 0.60), contribution("B", 0.55)],
            &catalog(),
            0.05,
        );
        assert!(at_threshold.ambiguous);

        let just_under = coordinate(
            &[contribution("A", 0.60), contribution("B", 0.55)],
            &catalog(),
            0.0499,
        );
        assert!(!just_under.ambiguous);
    }

    #[test]
    fn ties_break_lexicographically() {
        let detection = coordinate(
            &[contribution("OpenEphys", 0.5), contribution("Blackrock", 0.5)],
            &catalog(),
            0.0,
        );
        assert_eq!(detection.primary.as_deref(), Some("Blackrock"));
    }

    #[test]
    fn authority_weights_and_clipping_apply() {
        let boosted = DetectorContribution {
            format: "SpikeGLX".into(),
            confidence: 0.9,
            evidence: String::new(),
            authority: 2.0,
        };
        let detection = coordinate(&[boosted], &catalog(), 0.05);
        assert_eq!(detection.ranked[0].confidence, 1.0);
    }

    #[test]
    fn disambiguation_resolves_primary_and_clears_ambiguity() {
        let detection = coordinate(
            &[contribution("SpikeGLX", 0.52), contribution("OpenEphys", 0.50)],
            &catalog(),
            0.05,
        );
        let resolved = detection.disambiguated("OpenEphys", &catalog());
        assert_eq!(resolved.primary.as_deref(), Some("OpenEphys"));
        assert_eq!(resolved.interface.as_deref(), Some("openephys-recording"));
        assert!(!resolved.ambiguous);
        assert_eq!(resolved.alternatives, vec!["SpikeGLX".to_string()]);
    }

    #[test]
    fn no_contributions_yield_empty_detection() {
        let detection = coordinate(&[], &catalog(), 0.05);
        assert!(detection.primary.is_none());
        assert!(!detection.ambiguous);
        assert!(detection.ranked.is_empty());
    }
}
