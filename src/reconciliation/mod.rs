use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::config::ReconThresholds;
use crate::models::{CandidateId, Category, ResultStatus, TallyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    NoData,
    MissingInternal,
    MissingMec,
    Match,
    MinorDiscrepancy,
    MajorDiscrepancy,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoData => write!(f, "no_data"),
            Self::MissingInternal => write!(f, "missing_internal"),
            Self::MissingMec => write!(f, "missing_mec"),
            Self::Match => write!(f, "match"),
            Self::MinorDiscrepancy => write!(f, "minor_discrepancy"),
            Self::MajorDiscrepancy => write!(f, "major_discrepancy"),
        }
    }
}

/// Identity key pairing internal and official results. No fuzzy matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ComparisonKey {
    pub constituency: String,
    pub category: Category,
    pub polling_center_id: String,
}

impl ComparisonKey {
    pub fn of(result: &TallyResult) -> Self {
        Self {
            constituency: result.constituency.clone(),
            category: result.category(),
            polling_center_id: result.polling_center_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateDelta {
    pub candidate_id: CandidateId,
    pub internal: Option<u32>,
    pub official: Option<u32>,
    /// internal minus official, missing counts treated as zero
    pub difference: i64,
}

/// Derived comparison for one key; recomputed on every query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    #[serde(flatten)]
    pub key: ComparisonKey,
    pub internal_result_id: Option<String>,
    pub official_result_id: Option<String>,
    pub internal_total: Option<u32>,
    pub official_total: Option<u32>,
    pub absolute_diff: Option<u32>,
    pub percentage_diff: Option<f64>,
    pub classification: Classification,
    pub candidate_deltas: Vec<CandidateDelta>,
}

/// |i - o| / max(i, o) as a percentage, 0 when both are 0.
pub fn percentage_diff(internal: u32, official: u32) -> f64 {
    let max = internal.max(official);
    if max == 0 {
        return 0.0;
    }
    internal.abs_diff(official) as f64 * 100.0 / max as f64
}

/// Pure function of the two totals; first matching rule wins.
pub fn classify(internal: Option<u32>, official: Option<u32>, thresholds: &ReconThresholds) -> Classification {
    match (internal, official) {
        (None, None) => Classification::NoData,
        (None, Some(_)) => Classification::MissingInternal,
        (Some(_), None) => Classification::MissingMec,
        (Some(i), Some(o)) => {
            let pct = percentage_diff(i, o);
            if pct <= thresholds.match_pct {
                Classification::Match
            } else if pct <= thresholds.minor_pct {
                Classification::MinorDiscrepancy
            } else {
                Classification::MajorDiscrepancy
            }
        }
    }
}

/// Pick the result that speaks for one side of a key.
///
/// Rejected results never count. A verified result wins, otherwise the most
/// recently updated one, ties broken by id so the choice is stable.
pub fn representative<'a>(candidates: &[&'a TallyResult]) -> Option<&'a TallyResult> {
    candidates
        .iter()
        .copied()
        .filter(|r| r.status != ResultStatus::Rejected)
        .max_by(|a, b| {
            let a_verified = a.status == ResultStatus::Verified;
            let b_verified = b.status == ResultStatus::Verified;
            a_verified
                .cmp(&b_verified)
                .then_with(|| a.updated_at.cmp(&b.updated_at))
                .then_with(|| b.id.cmp(&a.id))
        })
}

fn candidate_deltas(internal: Option<&TallyResult>, official: Option<&TallyResult>) -> Vec<CandidateDelta> {
    let (Some(internal), Some(official)) = (internal, official) else {
        return Vec::new();
    };

    let internal_votes = internal.tallies.votes();
    let official_votes = official.tallies.votes();
    let candidates: BTreeSet<&CandidateId> = internal_votes.keys().chain(official_votes.keys()).collect();

    candidates
        .into_iter()
        .map(|id| {
            let i = internal_votes.get(id).copied();
            let o = official_votes.get(id).copied();
            CandidateDelta {
                candidate_id: id.clone(),
                internal: i,
                official: o,
                difference: i64::from(i.unwrap_or(0)) - i64::from(o.unwrap_or(0)),
            }
        })
        .collect()
}

/// Pair internal and official results by key and classify each pair.
/// Rows come back sorted by key, so equal inputs give equal output.
pub fn compare(
    internal: &[TallyResult],
    official: &[TallyResult],
    thresholds: &ReconThresholds,
) -> Vec<ComparisonRow> {
    let mut sides: BTreeMap<ComparisonKey, (Vec<&TallyResult>, Vec<&TallyResult>)> = BTreeMap::new();
    for result in internal {
        sides.entry(ComparisonKey::of(result)).or_default().0.push(result);
    }
    for result in official {
        sides.entry(ComparisonKey::of(result)).or_default().1.push(result);
    }

    sides
        .into_iter()
        .map(|(key, (internal_side, official_side))| {
            let i = representative(&internal_side);
            let o = representative(&official_side);
            let internal_total = i.map(|r| r.total_votes);
            let official_total = o.map(|r| r.total_votes);
            let (absolute_diff, pct) = match (internal_total, official_total) {
                (Some(a), Some(b)) => (Some(a.abs_diff(b)), Some(percentage_diff(a, b))),
                _ => (None, None),
            };

            ComparisonRow {
                key,
                internal_result_id: i.map(|r| r.id.clone()),
                official_result_id: o.map(|r| r.id.clone()),
                internal_total,
                official_total,
                absolute_diff,
                percentage_diff: pct,
                classification: classify(internal_total, official_total, thresholds),
                candidate_deltas: candidate_deltas(i, o),
            }
        })
        .collect()
}
