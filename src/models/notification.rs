use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{now, string_enum};
use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

string_enum!(Severity {
    Info => "info",
    Success => "success",
    Warning => "warning",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    Result,
    Duplicate,
    Verification,
    Complaint,
    Account,
}

string_enum!(NotificationCategory {
    Result => "result",
    Duplicate => "duplicate",
    Verification => "verification",
    Complaint => "complaint",
    Account => "account",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub category: NotificationCategory,
    pub target_user_id: String,
    pub related_result_id: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        target_user_id: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        category: NotificationCategory,
        related_result_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            message: message.into(),
            severity,
            category,
            target_user_id: target_user_id.into(),
            related_result_id,
            is_read: false,
            created_at: now(),
        }
    }
}
