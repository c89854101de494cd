use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::duplicates::Detection;
use crate::models::{ResultStatus, TallyResult};

/// Wire names of live push events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushKind {
    #[serde(rename = "NEW_RESULT")]
    NewResult,
    #[serde(rename = "RESULT_STATUS_CHANGED")]
    ResultStatusChanged,
    #[serde(rename = "ANALYTICS_UPDATE")]
    AnalyticsUpdate,
    #[serde(rename = "notification")]
    Notification,
}

/// `{type, data, timestamp}` as delivered to connected observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: PushKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl PushEvent {
    pub fn new(kind: PushKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Everything the dispatcher turns into notifications.
#[derive(Debug, Clone)]
pub enum StateChange {
    ResultSubmitted {
        result: TallyResult,
        detection: Option<Detection>,
    },
    StatusChanged {
        result: TallyResult,
        previous: ResultStatus,
        actor_id: String,
    },
    GroupResolved {
        group_id: String,
        approved_result_id: String,
        reason: String,
        actor_id: String,
    },
    /// Raised by the complaints subsystem, which reuses this dispatcher.
    ComplaintStatusChanged {
        complaint_id: String,
        complainant_id: String,
        status: String,
    },
    UserRegistered {
        user_id: String,
        display_name: String,
    },
}
