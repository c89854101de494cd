use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duplicates::{DuplicateGroup, GroupState};
use crate::errors::EngineError;
use crate::models::{Actor, ResultStatus, TallyResult};

/// A reviewer's decision on a single pending result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "reason", rename_all = "snake_case")]
pub enum VerificationAction {
    Verify,
    Flag(String),
    Reject(String),
}

impl VerificationAction {
    pub fn target(&self) -> ResultStatus {
        match self {
            VerificationAction::Verify => ResultStatus::Verified,
            VerificationAction::Flag(_) => ResultStatus::Flagged,
            VerificationAction::Reject(_) => ResultStatus::Rejected,
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            VerificationAction::Verify => "verified",
            VerificationAction::Flag(_) => "flagged",
            VerificationAction::Reject(_) => "rejected",
        }
    }
}

/// One row transition, applied by the store with a compare-and-set on `from`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub result_id: String,
    pub from: ResultStatus,
    pub to: ResultStatus,
    pub reason: Option<String>,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn apply_to(&self, result: &mut TallyResult) {
        result.status = self.to;
        result.status_reason = self.reason.clone();
        result.verified_by = self.verified_by.clone();
        result.verified_at = self.verified_at;
        result.updated_at = self.at;
    }
}

pub fn authorize(actor: &Actor, action: &'static str) -> Result<(), EngineError> {
    if actor.can_verify() {
        Ok(())
    } else {
        Err(EngineError::Forbidden {
            actor_id: actor.id.clone(),
            action,
        })
    }
}

/// Trimmed reason, or a validation error naming what needed it.
pub fn require_reason(reason: &str, what: &str) -> Result<String, EngineError> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation(format!("a reason is required to {}", what)));
    }
    Ok(trimmed.to_string())
}

/// Plan a direct transition out of `pending`.
///
/// `group` is the duplicate group the result belongs to, if any. While that
/// group is open a verified member may still be rejected, which is how a
/// reviewer backs out of a verification before resolving the group.
pub fn plan_transition(
    result: &TallyResult,
    group: Option<&DuplicateGroup>,
    actor: &Actor,
    action: &VerificationAction,
    at: DateTime<Utc>,
) -> Result<StatusChange, EngineError> {
    authorize(actor, "change result status")?;

    let reason = match action {
        VerificationAction::Verify => None,
        VerificationAction::Flag(reason) => Some(require_reason(reason, "flag a result")?),
        VerificationAction::Reject(reason) => Some(require_reason(reason, "reject a result")?),
    };

    let revert = result.status == ResultStatus::Verified
        && matches!(action, VerificationAction::Reject(_))
        && group.is_some_and(|g| g.contains(&result.id) && g.state() == GroupState::Open);

    if result.status != ResultStatus::Pending && !revert {
        return Err(EngineError::State {
            id: result.id.clone(),
            status: result.status,
            attempted: action.past_tense(),
        });
    }

    let verified = matches!(action, VerificationAction::Verify);
    Ok(StatusChange {
        result_id: result.id.clone(),
        from: result.status,
        to: action.target(),
        reason,
        verified_by: verified.then(|| actor.id.clone()),
        verified_at: verified.then_some(at),
        at,
    })
}

/// At most one verified result per tally key, except inside an open duplicate group.
pub fn check_single_verified(target: &TallyResult, same_key: &[TallyResult]) -> Result<(), EngineError> {
    if let Some(group_id) = target.duplicate_group_id.as_deref() {
        let members: Vec<TallyResult> = same_key
            .iter()
            .filter(|r| r.duplicate_group_id.as_deref() == Some(group_id))
            .cloned()
            .collect();
        if DuplicateGroup::new(group_id, members).state() == GroupState::Open {
            return Ok(());
        }
    }

    match same_key
        .iter()
        .find(|r| r.id != target.id && r.status == ResultStatus::Verified)
    {
        Some(existing) => Err(EngineError::Conflict(format!(
            "result {} is already verified for {}",
            existing.id,
            target.key()
        ))),
        None => Ok(()),
    }
}

/// Plan every transition needed to resolve a duplicate group onto one member.
///
/// Refuses to demote a member that is already verified; a reviewer has to
/// reject it explicitly first. `same_key` is every result under the group's
/// tally key; a verified result outside the group blocks resolution too.
pub fn plan_resolution(
    group: &DuplicateGroup,
    same_key: &[TallyResult],
    approved_id: &str,
    reason: &str,
    actor: &Actor,
    at: DateTime<Utc>,
) -> Result<Vec<StatusChange>, EngineError> {
    authorize(actor, "resolve duplicate groups")?;
    let reason = require_reason(reason, "resolve a duplicate group")?;

    let approved = group.get(approved_id).ok_or_else(|| {
        EngineError::Validation(format!(
            "result {} is not a member of duplicate group {}",
            approved_id, group.id
        ))
    })?;

    if let Some(verified) = group
        .members
        .iter()
        .find(|m| m.id != approved_id && m.status == ResultStatus::Verified)
    {
        return Err(EngineError::Conflict(format!(
            "result {} in duplicate group {} is already verified",
            verified.id, group.id
        )));
    }

    if let Some(outsider) = same_key
        .iter()
        .find(|r| !group.contains(&r.id) && r.status == ResultStatus::Verified)
    {
        return Err(EngineError::Conflict(format!(
            "result {} is already verified for {} outside duplicate group {}",
            outsider.id,
            outsider.key(),
            group.id
        )));
    }

    let mut changes = Vec::new();
    if approved.status != ResultStatus::Verified {
        changes.push(StatusChange {
            result_id: approved.id.clone(),
            from: approved.status,
            to: ResultStatus::Verified,
            reason: Some(reason.clone()),
            verified_by: Some(actor.id.clone()),
            verified_at: Some(at),
            at,
        });
    }

    let superseded = format!(
        "superseded by resolution of duplicate group {}: {}",
        group.id, reason
    );
    for member in &group.members {
        if member.id == approved_id || member.status == ResultStatus::Rejected {
            continue;
        }
        changes.push(StatusChange {
            result_id: member.id.clone(),
            from: member.status,
            to: ResultStatus::Rejected,
            reason: Some(superseded.clone()),
            verified_by: None,
            verified_at: None,
            at,
        });
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CandidateId, NewResult, ResultSource, Role, SubmissionChannel, TallyMap, VoteTallies,
    };
    use chrono::Utc;

    fn pending(submitter: &str) -> TallyResult {
        let mut votes = TallyMap::new();
        votes.insert(CandidateId::new("cand-a").unwrap(), 100);
        TallyResult::new(
            NewResult {
                polling_center_id: "C1".into(),
                constituency: "North".into(),
                tallies: VoteTallies::Mp(votes),
                invalid_votes: 0,
                total_votes: 100,
                source: ResultSource::Internal,
                submission_channel: SubmissionChannel::Sms,
            },
            submitter.into(),
        )
    }

    fn supervisor() -> Actor {
        Actor::new("sup-1", Role::Supervisor)
    }

    #[test]
    fn test_verify_sets_verifier() {
        let result = pending("obs-1");
        let now = Utc::now();
        let change = plan_transition(&result, None, &supervisor(), &VerificationAction::Verify, now).unwrap();
        assert_eq!(change.to, ResultStatus::Verified);
        assert_eq!(change.verified_by.as_deref(), Some("sup-1"));
        assert_eq!(change.verified_at, Some(now));
        assert!(change.reason.is_none());
    }

    #[test]
    fn test_flag_requires_reason() {
        let result = pending("obs-1");
        let err = plan_transition(
            &result,
            None,
            &supervisor(),
            &VerificationAction::Flag("   ".into()),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let change = plan_transition(
            &result,
            None,
            &supervisor(),
            &VerificationAction::Reject(" blurry photo ".into()),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(change.reason.as_deref(), Some("blurry photo"));
        assert!(change.verified_by.is_none());
    }

    #[test]
    fn test_observers_cannot_transition() {
        let result = pending("obs-1");
        let err = plan_transition(
            &result,
            None,
            &Actor::new("obs-2", Role::Observer),
            &VerificationAction::Verify,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[test]
    fn test_terminal_states_stay_terminal() {
        for status in [ResultStatus::Verified, ResultStatus::Flagged, ResultStatus::Rejected] {
            let mut result = pending("obs-1");
            result.status = status;
            let err = plan_transition(&result, None, &supervisor(), &VerificationAction::Verify, Utc::now())
                .unwrap_err();
            match err {
                EngineError::State { status: current, .. } => assert_eq!(current, status),
                other => panic!("expected state error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_single_verified_outside_groups() {
        let target = pending("obs-1");
        let mut other = pending("obs-2");
        other.status = ResultStatus::Verified;
        assert!(check_single_verified(&target, &[other.clone()]).is_err());

        // inside an open group a second verification is tolerated until resolution
        let mut grouped_target = target.clone();
        grouped_target.duplicate_group_id = Some("g".into());
        other.duplicate_group_id = Some("g".into());
        assert!(check_single_verified(&grouped_target, &[other, grouped_target.clone()]).is_ok());
    }

    #[test]
    fn test_resolution_plan_rejects_the_rest() {
        let a = pending("obs-1");
        let b = pending("obs-2");
        let mut c = pending("obs-3");
        c.status = ResultStatus::Flagged;
        let group = DuplicateGroup::new("g1", vec![a.clone(), b.clone(), c.clone()]);

        let changes = plan_resolution(&group, &[], &a.id, "verified against photos", &supervisor(), Utc::now())
            .unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].result_id, a.id);
        assert_eq!(changes[0].to, ResultStatus::Verified);
        for change in &changes[1..] {
            assert_eq!(change.to, ResultStatus::Rejected);
            assert!(change.reason.as_deref().unwrap().contains("duplicate group g1"));
        }
    }

    #[test]
    fn test_resolution_refuses_to_demote_verified_member() {
        let a = pending("obs-1");
        let mut b = pending("obs-2");
        b.status = ResultStatus::Verified;
        let group = DuplicateGroup::new("g1", vec![a.clone(), b]);

        let err = plan_resolution(&group, &[], &a.id, "photos", &supervisor(), Utc::now()).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_verified_member_of_open_group_can_be_rejected() {
        let mut a = pending("obs-1");
        let mut b = pending("obs-2");
        a.status = ResultStatus::Verified;
        b.status = ResultStatus::Verified;
        let group = DuplicateGroup::new("g1", vec![a.clone(), b.clone()]);
        let reject = VerificationAction::Reject("verified the wrong sheet".into());

        let change = plan_transition(&b, Some(&group), &supervisor(), &reject, Utc::now()).unwrap();
        assert_eq!((change.from, change.to), (ResultStatus::Verified, ResultStatus::Rejected));
        assert!(change.verified_by.is_none() && change.verified_at.is_none());

        // Only rejection backs out of a verification
        let flag = VerificationAction::Flag("unsure".into());
        assert!(matches!(
            plan_transition(&b, Some(&group), &supervisor(), &flag, Utc::now()),
            Err(EngineError::State { .. })
        ));
        // Outside a group verified stays verified
        assert!(matches!(
            plan_transition(&b, None, &supervisor(), &reject, Utc::now()),
            Err(EngineError::State { .. })
        ));
    }

    #[test]
    fn test_resolved_group_members_stay_terminal() {
        let mut a = pending("obs-1");
        let mut b = pending("obs-2");
        a.status = ResultStatus::Verified;
        b.status = ResultStatus::Rejected;
        let group = DuplicateGroup::new("g1", vec![a.clone(), b]);
        assert_eq!(group.state(), GroupState::Resolved);

        let err = plan_transition(
            &a,
            Some(&group),
            &supervisor(),
            &VerificationAction::Reject("changed my mind".into()),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::State { status: ResultStatus::Verified, .. }));
    }

    #[test]
    fn test_resolution_refuses_verified_result_outside_group() {
        let mut outsider = pending("obs-9");
        outsider.status = ResultStatus::Verified;
        let a = pending("obs-1");
        let b = pending("obs-2");
        let group = DuplicateGroup::new("g1", vec![a.clone(), b.clone()]);
        let same_key = vec![outsider.clone(), a.clone(), b];

        let err = plan_resolution(&group, &same_key, &a.id, "photos", &supervisor(), Utc::now())
            .unwrap_err();
        match err {
            EngineError::Conflict(msg) => assert!(msg.contains(&outsider.id)),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_resolution_validates_inputs() {
        let a = pending("obs-1");
        let group = DuplicateGroup::new("g1", vec![a.clone(), pending("obs-2")]);
        assert!(matches!(
            plan_resolution(&group, &[], &a.id, "", &supervisor(), Utc::now()),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            plan_resolution(&group, &[], "stranger", "photos", &supervisor(), Utc::now()),
            Err(EngineError::Validation(_))
        ));
    }
}
