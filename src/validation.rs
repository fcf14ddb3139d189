//! Ensemble validation aggregation.
//!
//! The Evaluation worker fans a converted artifact out to several
//! validators (NWB Inspector, PyNWB, DANDI, ...) and hands their raw issue
//! lists back to the core. This module folds those lists into one
//! [`ValidationReport`]: issues are deduplicated by rule and normalized
//! location, contradictory severity assignments are voted on, and a
//! weighted quality score plus a composite status are derived.
//!
//! The aggregator is pure and byte-deterministic: identical inputs always
//! produce identical output, with merged issues ordered by (severity
//! descending, rule ascending, location ascending). Merging is commutative,
//! associative, and idempotent over validator responses.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Issue severity, ordered so `Critical` compares greatest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::Error,
        Severity::Warning,
        Severity::Info,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "Critical",
            Severity::Error => "Error",
            Severity::Warning => "Warning",
            Severity::Info => "Info",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One issue as reported by a single validator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidatorIssue {
    pub severity: Severity,
    /// Stable rule identifier, e.g. `check_timestamps_ascending`.
    pub rule: String,
    /// Location path inside the artifact, e.g. `/acquisition/e-series`.
    pub location: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
}

/// Raw response of one validator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidatorResponse {
    /// Validator identity, e.g. `nwb-inspector`.
    pub validator: String,
    pub issues: Vec<ValidatorIssue>,
}

/// An issue after deduplication across validators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergedIssue {
    pub severity: Severity,
    pub rule: String,
    pub location: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
    /// Every validator that reported this rule at this location, sorted.
    pub validators: Vec<String>,
    /// Set when validators disagreed on severity; the recorded severity is
    /// the vote winner.
    pub severity_disagreement: bool,
}

/// Per-severity issue counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub error: usize,
    pub warning: usize,
    pub info: usize,
}

impl SeverityCounts {
    fn bump(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::Error => self.error += 1,
            Severity::Warning => self.warning += 1,
            Severity::Info => self.info += 1,
        }
    }
}

/// Composite verdict over the merged issue set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    Pass,
    Warning,
    Fail,
}

/// Score weights per severity. Defaults: Critical 25, Error 10, Warning 2,
/// Info 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWeights {
    pub critical: u32,
    pub error: u32,
    pub warning: u32,
    pub info: u32,
}

impl Default for ValidationWeights {
    fn default() -> Self {
        Self {
            critical: 25,
            error: 10,
            warning: 2,
            info: 0,
        }
    }
}

impl ValidationWeights {
    fn weight(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Critical => self.critical,
            Severity::Error => self.error,
            Severity::Warning => self.warning,
            Severity::Info => self.info,
        }
    }
}

/// How contradictory severity assignments are resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteStrategy {
    /// Take the maximum severity any validator assigned (safe default).
    #[default]
    Max,
    /// Take the most frequent severity; ties fall back to the maximum.
    Mode,
}

/// Aggregated validation outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issues: Vec<MergedIssue>,
    pub counts: SeverityCounts,
    /// Quality score in [0, 100].
    pub score: u32,
    pub status: ValidationStatus,
}

impl ValidationReport {
    /// An empty report: perfect score, passing status.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            issues: Vec::new(),
            counts: SeverityCounts::default(),
            score: 100,
            status: ValidationStatus::Pass,
        }
    }
}

/// Fold validator responses into a deterministic report.
#[must_use]
pub fn aggregate(
    responses: &[ValidatorResponse],
    weights: ValidationWeights,
    vote: VoteStrategy,
) -> ValidationReport {
    #[derive(Default)]
    struct Bucket {
        severities: Vec<Severity>,
        validators: Vec<String>,
        message: String,
        fix_hint: Option<String>,
    }

    let mut buckets: FxHashMap<(String, String), Bucket> = FxHashMap::default();
    for response in responses {
        for issue in &response.issues {
            let key = (issue.rule.clone(), normalize_location(&issue.location));
            let bucket = buckets.entry(key).or_default();
            bucket.severities.push(issue.severity);
            if !bucket.validators.iter().any(|v| v == &response.validator) {
                bucket.validators.push(response.validator.clone());
            }
            // Lexicographically smallest message/hint win, keeping the
            // merge independent of response order.
            if bucket.message.is_empty() || issue.message < bucket.message {
                bucket.message = issue.message.clone();
            }
            match (&bucket.fix_hint, &issue.fix_hint) {
                (None, Some(_)) => bucket.fix_hint = issue.fix_hint.clone(),
                (Some(current), Some(candidate)) if candidate < current => {
                    bucket.fix_hint = issue.fix_hint.clone();
                }
                _ => {}
            }
        }
    }

    let mut issues: Vec<MergedIssue> = buckets
        .into_iter()
        .map(|((rule, location), mut bucket)| {
            bucket.validators.sort();
            let disagreement = bucket
                .severities
                .iter()
                .any(|s| *s != bucket.severities[0]);
            MergedIssue {
                severity: resolve_severity(&bucket.severities, vote),
                rule,
                location,
                message: bucket.message,
                fix_hint: bucket.fix_hint,
                validators: bucket.validators,
                severity_disagreement: disagreement,
            }
        })
        .collect();

    issues.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.rule.cmp(&b.rule))
            .then_with(|| a.location.cmp(&b.location))
    });

    let mut counts = SeverityCounts::default();
    let mut penalty: u64 = 0;
    for issue in &issues {
        counts.bump(issue.severity);
        penalty += u64::from(weights.weight(issue.severity));
    }
    let score = 100u64.saturating_sub(penalty) as u32;

    let status = if counts.critical > 0 || counts.error > 0 {
        ValidationStatus::Fail
    } else if counts.warning > 0 {
        ValidationStatus::Warning
    } else {
        ValidationStatus::Pass
    };

    ValidationReport {
        issues,
        counts,
        score,
        status,
    }
}

fn resolve_severity(observed: &[Severity], vote: VoteStrategy) -> Severity {
    let max = observed.iter().copied().max().unwrap_or(Severity::Info);
    match vote {
        VoteStrategy::Max => max,
        VoteStrategy::Mode => {
            let mut tally: FxHashMap<Severity, usize> = FxHashMap::default();
            for s in observed {
                *tally.entry(*s).or_default() += 1;
            }
            let best = tally.values().copied().max().unwrap_or(0);
            // Ties fall back to the maximum severity among the winners.
            Severity::ALL
                .into_iter()
                .filter(|s| tally.get(s).copied().unwrap_or(0) == best)
                .max()
                .unwrap_or(max)
        }
    }
}

/// Location normalization used by the dedup key: trimmed, single leading
/// slash, no trailing slash.
#[must_use]
pub fn normalize_location(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(severity: Severity, rule: &str, location: &str) -> ValidatorIssue {
        ValidatorIssue {
            severity,
            rule: rule.into(),
            location: location.into(),
            message: format!("{rule} at {location}"),
            fix_hint: None,
        }
    }

    fn response(validator: &str, issues: Vec<ValidatorIssue>) -> ValidatorResponse {
        ValidatorResponse {
            validator: validator.into(),
            issues,
        }
    }

    #[test]
    fn duplicates_collapse_and_keep_validator_union() {
        let a = response(
            "nwb-inspector",
            vec![issue(Severity::Warning, "w1", "/general")],
        );
        let b = response("pynwb", vec![issue(Severity::Warning, "w1", "general/")]);

        let report = aggregate(&[a, b], ValidationWeights::default(), VoteStrategy::Max);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].validators, vec!["nwb-inspector", "pynwb"]);
        assert!(!report.issues[0].severity_disagreement);
    }

    #[test]
    fn severity_disagreement_takes_max_and_is_recorded() {
        let a = response("pynwb", vec![issue(Severity::Warning, "r", "/x")]);
        let b = response("dandi", vec![issue(Severity::Error, "r", "/x")]);

        let report = aggregate(&[a, b], ValidationWeights::default(), VoteStrategy::Max);
        assert_eq!(report.issues[0].severity, Severity::Error);
        assert!(report.issues[0].severity_disagreement);
        assert_eq!(report.status, ValidationStatus::Fail);
    }

    #[test]
    fn mode_vote_prefers_majority() {
        let rs = vec![
            response("a", vec![issue(Severity::Warning, "r", "/x")]),
            response("b", vec![issue(Severity::Warning, "r", "/x")]),
            response("c", vec![issue(Severity::Critical, "r", "/x")]),
        ];
        let report = aggregate(&rs, ValidationWeights::default(), VoteStrategy::Mode);
        assert_eq!(report.issues[0].severity, Severity::Warning);
    }

    #[test]
    fn score_uses_default_weights_and_clamps_at_zero() {
        let two_warnings = response(
            "v",
            vec![
                issue(Severity::Warning, "w1", "/a"),
                issue(Severity::Warning, "w2", "/b"),
            ],
        );
        let report = aggregate(
            std::slice::from_ref(&two_warnings),
            ValidationWeights::default(),
            VoteStrategy::Max,
        );
        assert_eq!(report.score, 96);
        assert_eq!(report.status, ValidationStatus::Warning);

        let heavy = response(
            "v",
            (0..5)
                .map(|i| issue(Severity::Critical, &format!("c{i}"), "/x"))
                .collect(),
        );
        let report = aggregate(&[heavy], ValidationWeights::default(), VoteStrategy::Max);
        assert_eq!(report.score, 0);
    }

    #[test]
    fn ordering_is_severity_desc_then_rule_then_location() {
        let r = response(
            "v",
            vec![
                issue(Severity::Info, "a", "/z"),
                issue(Severity::Critical, "z", "/a"),
                issue(Severity::Critical, "a", "/b"),
                issue(Severity::Critical, "a", "/a"),
            ],
        );
        let report = aggregate(&[r], ValidationWeights::default(), VoteStrategy::Max);
        let keys: Vec<(&str, &str)> = report
            .issues
            .iter()
            .map(|i| (i.rule.as_str(), i.location.as_str()))
            .collect();
        assert_eq!(keys, vec![("a", "/a"), ("a", "/b"), ("z", "/a"), ("a", "/z")]);
    }

    #[test]
    fn empty_input_passes_with_perfect_score() {
        let report = aggregate(&[], ValidationWeights::default(), VoteStrategy::Max);
        assert_eq!(report, ValidationReport::empty());
    }
}
