use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use uuid::Uuid;

use crate::config::DuplicatePolicy;
use crate::models::{ResultStatus, TallyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// No canonical member chosen yet.
    Open,
    /// Exactly one member verified, every other member rejected.
    Resolved,
}

/// Results sharing a `duplicate_group_id`, handled as one aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub id: String,
    pub members: Vec<TallyResult>,
}

impl DuplicateGroup {
    pub fn new(id: impl Into<String>, mut members: Vec<TallyResult>) -> Self {
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Self { id: id.into(), members }
    }

    pub fn member_ids(&self) -> BTreeSet<String> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub fn get(&self, result_id: &str) -> Option<&TallyResult> {
        self.members.iter().find(|m| m.id == result_id)
    }

    pub fn contains(&self, result_id: &str) -> bool {
        self.get(result_id).is_some()
    }

    pub fn state(&self) -> GroupState {
        let verified = self
            .members
            .iter()
            .filter(|m| m.status == ResultStatus::Verified)
            .count();
        let rejected = self
            .members
            .iter()
            .filter(|m| m.status == ResultStatus::Rejected)
            .count();

        if verified == 1 && verified + rejected == self.members.len() {
            GroupState::Resolved
        } else {
            GroupState::Open
        }
    }

    /// The single verified member of a resolved group.
    pub fn canonical(&self) -> Option<&TallyResult> {
        match self.state() {
            GroupState::Resolved => self.members.iter().find(|m| m.status == ResultStatus::Verified),
            GroupState::Open => None,
        }
    }
}

/// Bucket grouped results by group id; ungrouped results are skipped.
pub fn group_results(results: Vec<TallyResult>) -> BTreeMap<String, DuplicateGroup> {
    let mut buckets: BTreeMap<String, Vec<TallyResult>> = BTreeMap::new();
    for result in results {
        if let Some(group_id) = result.duplicate_group_id.clone() {
            buckets.entry(group_id).or_default().push(result);
        }
    }

    buckets
        .into_iter()
        .map(|(id, members)| (id.clone(), DuplicateGroup::new(id, members)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    /// Nonzero totals within the tolerance.
    SimilarTotals,
    /// Different submitters inside the conflict window, whatever the totals.
    ConflictingReports,
}

/// What the detector decided for a new submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub group_id: String,
    pub related_ids: BTreeSet<String>,
    pub reason: String,
}

/// Updated copies of every row touched by linking a new submission.
#[derive(Debug, Clone)]
pub struct Linkage {
    pub detection: Detection,
    pub new_result: TallyResult,
    pub siblings: Vec<TallyResult>,
}

pub fn totals_within(a: u32, b: u32, tolerance_pct: f64) -> bool {
    if a == 0 || b == 0 {
        return false;
    }
    let diff = a.abs_diff(b) as f64;
    let max = a.max(b) as f64;
    diff * 100.0 / max <= tolerance_pct
}

pub fn match_rule(policy: &DuplicatePolicy, new: &TallyResult, existing: &TallyResult) -> Option<MatchRule> {
    if new.id == existing.id || new.key() != existing.key() {
        return None;
    }
    if totals_within(new.total_votes, existing.total_votes, policy.tolerance_pct) {
        return Some(MatchRule::SimilarTotals);
    }
    let gap = (new.created_at - existing.created_at).abs();
    if new.submitter_id != existing.submitter_id && gap <= policy.conflict_window {
        return Some(MatchRule::ConflictingReports);
    }
    None
}

fn describe(policy: &DuplicatePolicy, rule: MatchRule, other: &TallyResult, relation: &str) -> String {
    match rule {
        MatchRule::SimilarTotals => format!(
            "vote totals within {}% of {} submission from {}",
            policy.tolerance_pct, relation, other.submitter_id
        ),
        MatchRule::ConflictingReports => format!(
            "conflicting report: {} submission from {} within {} minutes (total {})",
            relation,
            other.submitter_id,
            policy.conflict_window.num_minutes(),
            other.total_votes
        ),
    }
}

/// Decide whether `new` joins a duplicate group among `siblings`.
///
/// Matching siblings pull in the whole group they already belong to, and
/// several matched groups merge into the one holding the oldest member.
/// Related ids are always "every other member", which keeps the relation
/// symmetric. Statuses are never touched.
pub fn detect(policy: &DuplicatePolicy, new: &TallyResult, siblings: &[TallyResult]) -> Option<Linkage> {
    let mut matches: Vec<(&TallyResult, MatchRule)> = siblings
        .iter()
        .filter_map(|s| match_rule(policy, new, s).map(|rule| (s, rule)))
        .collect();

    if matches.is_empty() {
        return None;
    }

    // Similar totals explain the suspicion better than timing alone
    matches.sort_by_key(|(s, rule)| (*rule != MatchRule::SimilarTotals, s.created_at));

    let matched_groups: BTreeSet<&str> = matches
        .iter()
        .filter_map(|(s, _)| s.duplicate_group_id.as_deref())
        .collect();
    let matched_ids: BTreeSet<&str> = matches.iter().map(|(s, _)| s.id.as_str()).collect();

    let mut members: Vec<&TallyResult> = siblings
        .iter()
        .filter(|s| s.id != new.id)
        .filter(|s| {
            matched_ids.contains(s.id.as_str())
                || s.duplicate_group_id
                    .as_deref()
                    .map(|g| matched_groups.contains(g))
                    .unwrap_or(false)
        })
        .collect();
    members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let group_id = members
        .iter()
        .find_map(|m| m.duplicate_group_id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut all_ids: BTreeSet<String> = members.iter().map(|m| m.id.clone()).collect();
    all_ids.insert(new.id.clone());

    let (first_match, first_rule) = matches[0];
    let reason = describe(policy, first_rule, first_match, "existing");

    let others = |id: &str| -> BTreeSet<String> {
        all_ids.iter().filter(|other| other.as_str() != id).cloned().collect()
    };

    let mut new_result = new.clone();
    new_result.is_duplicate = true;
    new_result.duplicate_group_id = Some(group_id.clone());
    new_result.duplicate_reason = Some(reason.clone());
    new_result.related_result_ids = others(&new.id);

    let siblings = members
        .into_iter()
        .map(|member| {
            let mut updated = member.clone();
            if updated.duplicate_reason.is_none() {
                let rule = match_rule(policy, new, member).unwrap_or(first_rule);
                updated.duplicate_reason = Some(describe(policy, rule, new, "later"));
            }
            updated.is_duplicate = true;
            updated.duplicate_group_id = Some(group_id.clone());
            updated.related_result_ids = others(&member.id);
            updated.updated_at = new.created_at;
            updated
        })
        .collect();

    Some(Linkage {
        detection: Detection {
            group_id,
            related_ids: new_result.related_result_ids.clone(),
            reason,
        },
        new_result,
        siblings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CandidateId, NewResult, ResultSource, SubmissionChannel, TallyMap, VoteTallies,
    };
    use chrono::Duration;

    fn result(submitter: &str, total: u32) -> TallyResult {
        let mut votes = TallyMap::new();
        votes.insert(CandidateId::new("cand-a").unwrap(), total);
        TallyResult::new(
            NewResult {
                polling_center_id: "C1".into(),
                constituency: "North".into(),
                tallies: VoteTallies::President(votes),
                invalid_votes: 0,
                total_votes: total,
                source: ResultSource::Internal,
                submission_channel: SubmissionChannel::Web,
            },
            submitter.into(),
        )
    }

    fn assert_symmetric(rows: &[TallyResult]) {
        for a in rows {
            for b in rows {
                if a.id != b.id {
                    assert_eq!(
                        a.related_result_ids.contains(&b.id),
                        b.related_result_ids.contains(&a.id),
                        "asymmetric link between {} and {}",
                        a.id,
                        b.id
                    );
                }
            }
        }
    }

    #[test]
    fn test_totals_within_tolerance() {
        assert!(totals_within(1000, 1005, 2.0));
        assert!(totals_within(1000, 980, 2.0));
        assert!(!totals_within(1000, 979, 2.0));
        assert!(!totals_within(0, 0, 2.0));
    }

    #[test]
    fn test_single_submission_is_never_a_duplicate() {
        let policy = DuplicatePolicy::default();
        let first = result("obs-1", 1000);
        assert!(detect(&policy, &first, &[]).is_none());
        assert!(detect(&policy, &first, &[first.clone()]).is_none());
    }

    #[test]
    fn test_similar_totals_form_a_new_group() {
        let policy = DuplicatePolicy::default();
        let first = result("obs-1", 1000);
        let second = result("obs-2", 1005);

        let linkage = detect(&policy, &second, &[first.clone()]).unwrap();
        assert_eq!(linkage.detection.related_ids, BTreeSet::from([first.id.clone()]));
        assert!(linkage.detection.reason.contains("within 2% of existing submission from obs-1"));
        assert_eq!(linkage.siblings.len(), 1);
        assert_eq!(
            linkage.siblings[0].duplicate_group_id,
            linkage.new_result.duplicate_group_id
        );
        assert!(linkage.siblings[0].is_duplicate);
        assert_eq!(linkage.new_result.status, ResultStatus::Pending);

        let mut rows = linkage.siblings.clone();
        rows.push(linkage.new_result.clone());
        assert_symmetric(&rows);
    }

    #[test]
    fn test_conflicting_reports_need_different_submitters() {
        let policy = DuplicatePolicy::default();
        let first = result("obs-1", 1000);

        let same_submitter = result("obs-1", 700);
        assert!(detect(&policy, &same_submitter, &[first.clone()]).is_none());

        let other_submitter = result("obs-2", 700);
        let linkage = detect(&policy, &other_submitter, &[first]).unwrap();
        assert!(linkage.detection.reason.starts_with("conflicting report"));
    }

    #[test]
    fn test_conflict_window_is_respected() {
        let policy = DuplicatePolicy {
            tolerance_pct: 2.0,
            conflict_window: Duration::minutes(10),
        };
        let mut first = result("obs-1", 1000);
        first.created_at = first.created_at - Duration::minutes(30);
        let late = result("obs-2", 700);
        assert!(detect(&policy, &late, &[first]).is_none());
    }

    #[test]
    fn test_joining_existing_group_links_every_member() {
        let policy = DuplicatePolicy::default();
        let a = result("obs-1", 1000);
        let b = result("obs-2", 1004);
        let first = detect(&policy, &b, &[a.clone()]).unwrap();
        let group_id = first.detection.group_id.clone();

        let mut existing = first.siblings.clone();
        existing.push(first.new_result.clone());

        let c = result("obs-3", 1001);
        let second = detect(&policy, &c, &existing).unwrap();
        assert_eq!(second.detection.group_id, group_id);
        assert_eq!(second.detection.related_ids.len(), 2);

        let mut rows = second.siblings.clone();
        rows.push(second.new_result.clone());
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.related_result_ids.len() == 2));
        assert_symmetric(&rows);
    }

    #[test]
    fn test_matching_two_groups_merges_them() {
        let policy = DuplicatePolicy {
            tolerance_pct: 2.0,
            conflict_window: Duration::zero(),
        };
        let mut a = result("obs-1", 1000);
        a.duplicate_group_id = Some("g-old".into());
        let mut b = result("obs-2", 1010);
        b.duplicate_group_id = Some("g-new".into());
        b.created_at = a.created_at + Duration::seconds(5);

        let c = result("obs-3", 1005);
        let linkage = detect(&policy, &c, &[a.clone(), b.clone()]).unwrap();
        assert_eq!(linkage.detection.group_id, "g-old");
        assert!(linkage
            .siblings
            .iter()
            .all(|s| s.duplicate_group_id.as_deref() == Some("g-old")));
    }

    #[test]
    fn test_group_state() {
        let mut a = result("obs-1", 1000);
        let mut b = result("obs-2", 1000);
        let group = DuplicateGroup::new("g", vec![a.clone(), b.clone()]);
        assert_eq!(group.state(), GroupState::Open);
        assert!(group.canonical().is_none());

        a.status = ResultStatus::Verified;
        b.status = ResultStatus::Rejected;
        let group = DuplicateGroup::new("g", vec![a.clone(), b]);
        assert_eq!(group.state(), GroupState::Resolved);
        assert_eq!(group.canonical().map(|r| r.id.as_str()), Some(a.id.as_str()));
    }
}
