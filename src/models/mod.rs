mod notification;
mod tallies;

pub use notification::{Notification, NotificationCategory, Severity};
pub use tallies::{CandidateId, Category, TallyMap, VoteTallies};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::EngineError;

// Implements as_str/Display/FromStr for the plain string-coded enums stored in the database
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(EngineError::Storage(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        s
                    ))),
                }
            }
        }
    };
}

pub(crate) use string_enum;

/// Current time at the precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Internal,
    Official,
}

string_enum!(ResultSource { Internal => "internal", Official => "official" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionChannel {
    Web,
    Ussd,
    Whatsapp,
    Sms,
    Import,
}

string_enum!(SubmissionChannel {
    Web => "web",
    Ussd => "ussd",
    Whatsapp => "whatsapp",
    Sms => "sms",
    Import => "import",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Verified,
    Flagged,
    Rejected,
}

string_enum!(ResultStatus {
    Pending => "pending",
    Verified => "verified",
    Flagged => "flagged",
    Rejected => "rejected",
});

impl ResultStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Observer,
    Supervisor,
    Admin,
}

/// Authenticated identity behind a mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    pub fn can_verify(&self) -> bool {
        matches!(self.role, Role::Supervisor | Role::Admin)
    }
}

/// Siblings for duplicate detection and the verified-uniqueness rule share this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TallyKey {
    pub polling_center_id: String,
    pub category: Category,
    pub source: ResultSource,
}

impl fmt::Display for TallyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.polling_center_id, self.category, self.source)
    }
}

/// A submission as handed over by the ingestion boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResult {
    pub polling_center_id: String,
    pub constituency: String,
    pub tallies: VoteTallies,
    pub invalid_votes: u32,
    pub total_votes: u32,
    pub source: ResultSource,
    pub submission_channel: SubmissionChannel,
}

impl NewResult {
    /// Rejects submissions whose declared total disagrees with the tallies.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.polling_center_id.trim().is_empty() {
            return Err(EngineError::Validation("polling center id is required".into()));
        }
        if self.constituency.trim().is_empty() {
            return Err(EngineError::Validation("constituency is required".into()));
        }
        let expected = self.tallies.candidate_sum() + u64::from(self.invalid_votes);
        if expected != u64::from(self.total_votes) {
            return Err(EngineError::Validation(format!(
                "total votes {} does not equal invalid votes {} plus candidate votes {}",
                self.total_votes,
                self.invalid_votes,
                self.tallies.candidate_sum()
            )));
        }
        Ok(())
    }
}

/// One submission of vote tallies for a polling center and category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyResult {
    pub id: String,
    pub polling_center_id: String,
    pub constituency: String,
    pub tallies: VoteTallies,
    pub invalid_votes: u32,
    pub total_votes: u32,
    pub source: ResultSource,
    pub submission_channel: SubmissionChannel,
    pub submitter_id: String,
    pub status: ResultStatus,
    pub status_reason: Option<String>,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_duplicate: bool,
    pub duplicate_group_id: Option<String>,
    pub duplicate_reason: Option<String>,
    pub related_result_ids: BTreeSet<String>,
}

impl TallyResult {
    pub fn new(submission: NewResult, submitter_id: String) -> Self {
        let now = now();

        Self {
            id: Uuid::new_v4().to_string(),
            polling_center_id: submission.polling_center_id,
            constituency: submission.constituency,
            tallies: submission.tallies,
            invalid_votes: submission.invalid_votes,
            total_votes: submission.total_votes,
            source: submission.source,
            submission_channel: submission.submission_channel,
            submitter_id,
            status: ResultStatus::Pending,
            status_reason: None,
            verified_by: None,
            verified_at: None,
            created_at: now,
            updated_at: now,
            is_duplicate: false,
            duplicate_group_id: None,
            duplicate_reason: None,
            related_result_ids: BTreeSet::new(),
        }
    }

    pub fn category(&self) -> Category {
        self.tallies.category()
    }

    pub fn key(&self) -> TallyKey {
        TallyKey {
            polling_center_id: self.polling_center_id.clone(),
            category: self.category(),
            source: self.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(total: u32) -> NewResult {
        let mut votes = TallyMap::new();
        votes.insert(CandidateId::new("alice").unwrap(), 600);
        votes.insert(CandidateId::new("bob").unwrap(), 380);
        NewResult {
            polling_center_id: "C1".into(),
            constituency: "Lilongwe City Centre".into(),
            tallies: VoteTallies::President(votes),
            invalid_votes: 20,
            total_votes: total,
            source: ResultSource::Internal,
            submission_channel: SubmissionChannel::Web,
        }
    }

    #[test]
    fn test_totals_invariant() {
        assert!(submission(1000).validate().is_ok());
        match submission(999).validate() {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("999")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_new_result_starts_pending_and_ungrouped() {
        let result = TallyResult::new(submission(1000), "observer-1".into());
        assert_eq!(result.status, ResultStatus::Pending);
        assert!(!result.is_duplicate);
        assert!(result.related_result_ids.is_empty());
        assert_eq!(result.key().to_string(), "C1/president/internal");
    }

    #[test]
    fn test_tally_keys_order_by_center_category_source() {
        let key = |center: &str, category, source| TallyKey {
            polling_center_id: center.into(),
            category,
            source,
        };
        let keys: BTreeSet<TallyKey> = [
            key("C2", Category::President, ResultSource::Internal),
            key("C1", Category::Mp, ResultSource::Official),
            key("C1", Category::Mp, ResultSource::Internal),
            key("C1", Category::President, ResultSource::Official),
        ]
        .into_iter()
        .collect();

        let order: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(
            order,
            vec![
                "C1/president/official",
                "C1/mp/internal",
                "C1/mp/official",
                "C2/president/internal",
            ]
        );
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            ResultStatus::Pending,
            ResultStatus::Verified,
            ResultStatus::Flagged,
            ResultStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<ResultStatus>().unwrap(), status);
        }
        assert!("archived".parse::<ResultStatus>().is_err());
    }

    #[test]
    fn test_only_supervisors_and_admins_verify() {
        assert!(!Actor::new("o", Role::Observer).can_verify());
        assert!(Actor::new("s", Role::Supervisor).can_verify());
        assert!(Actor::new("a", Role::Admin).can_verify());
    }
}
