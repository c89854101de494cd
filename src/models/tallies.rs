use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::string_enum;
use crate::errors::EngineError;

lazy_static! {
    static ref CANDIDATE_ID: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap();
}

/// Election category a tally belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    President,
    Mp,
    Councilor,
}

string_enum!(Category {
    President => "president",
    Mp => "mp",
    Councilor => "councilor",
});

/// Candidate identifier, validated on construction and deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CandidateId(String);

impl CandidateId {
    pub fn new(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        if CANDIDATE_ID.is_match(&raw) {
            Ok(CandidateId(raw))
        } else {
            Err(EngineError::Validation(format!("invalid candidate id: {:?}", raw)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CandidateId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CandidateId::new(value)
    }
}

impl From<CandidateId> for String {
    fn from(id: CandidateId) -> Self {
        id.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type TallyMap = BTreeMap<CandidateId, u32>;

/// Per-candidate vote counts. The variant fixes the category, so a result can
/// never carry tallies for two categories at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", content = "votes", rename_all = "snake_case")]
pub enum VoteTallies {
    President(TallyMap),
    Mp(TallyMap),
    Councilor(TallyMap),
}

impl VoteTallies {
    pub fn from_parts(category: Category, votes: TallyMap) -> Self {
        match category {
            Category::President => VoteTallies::President(votes),
            Category::Mp => VoteTallies::Mp(votes),
            Category::Councilor => VoteTallies::Councilor(votes),
        }
    }

    pub fn category(&self) -> Category {
        match self {
            VoteTallies::President(_) => Category::President,
            VoteTallies::Mp(_) => Category::Mp,
            VoteTallies::Councilor(_) => Category::Councilor,
        }
    }

    pub fn votes(&self) -> &TallyMap {
        match self {
            VoteTallies::President(v) | VoteTallies::Mp(v) | VoteTallies::Councilor(v) => v,
        }
    }

    /// Sum of candidate votes, widened so large tallies cannot overflow.
    pub fn candidate_sum(&self) -> u64 {
        self.votes().values().map(|v| u64::from(*v)).sum()
    }
}
