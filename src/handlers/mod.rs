use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::engine::{CompareFilter, Engine};
use crate::errors::EngineError;
use crate::models::{Actor, NewResult, Notification, TallyResult};
use crate::reconciliation::ComparisonRow;
use crate::verification::VerificationAction;
use std::collections::BTreeMap;

/// Engine operations as any transport would hand them over, e.g. a JSON body
/// `{"op": "transition", "result_id": "...", "action": "flag", "reason": "..."}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    SubmitResult {
        result: NewResult,
    },
    Transition {
        result_id: String,
        action: ActionName,
        #[serde(default)]
        reason: Option<String>,
    },
    ResolveGroup {
        group_id: String,
        approved_result_id: String,
        reason: String,
    },
    ListDuplicateGroups,
    GetGroup {
        group_id: String,
    },
    GetResult {
        result_id: String,
    },
    Compare {
        #[serde(default)]
        filter: CompareFilter,
    },
    ListNotifications,
    UnreadCount,
    MarkRead {
        notification_id: String,
    },
    MarkAllRead,
    DeleteNotification {
        notification_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionName {
    Verify,
    Flag,
    Reject,
}

impl ActionName {
    // A missing reason becomes an empty one so the state machine reports it
    fn with_reason(self, reason: Option<String>) -> VerificationAction {
        match self {
            ActionName::Verify => VerificationAction::Verify,
            ActionName::Flag => VerificationAction::Flag(reason.unwrap_or_default()),
            ActionName::Reject => VerificationAction::Reject(reason.unwrap_or_default()),
        }
    }
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::SubmitResult { .. } => "submit_result",
            Request::Transition { .. } => "transition",
            Request::ResolveGroup { .. } => "resolve_group",
            Request::ListDuplicateGroups => "list_duplicate_groups",
            Request::GetGroup { .. } => "get_group",
            Request::GetResult { .. } => "get_result",
            Request::Compare { .. } => "compare",
            Request::ListNotifications => "list_notifications",
            Request::UnreadCount => "unread_count",
            Request::MarkRead { .. } => "mark_read",
            Request::MarkAllRead => "mark_all_read",
            Request::DeleteNotification { .. } => "delete_notification",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Response {
    Result(TallyResult),
    Results(Vec<TallyResult>),
    Groups(BTreeMap<String, Vec<TallyResult>>),
    Comparison(Vec<ComparisonRow>),
    Notifications(Vec<Notification>),
    Count(i64),
    Done,
}

/// Error payload with enough context for the caller to decide what to do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl From<&EngineError> for ErrorBody {
    fn from(e: &EngineError) -> Self {
        Self {
            code: e.kind(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

/// Route one request from an authenticated actor to the engine.
pub async fn handle_request(engine: &Engine, actor: &Actor, request: Request) -> Result<Response, EngineError> {
    let op = request.name();
    info!("Received request {} from {}", op, actor.id);

    let response = match request {
        Request::SubmitResult { result } => Response::Result(engine.submit_result(actor, result).await?),
        Request::Transition {
            result_id,
            action,
            reason,
        } => Response::Result(
            engine
                .transition(&result_id, actor, action.with_reason(reason))
                .await?,
        ),
        Request::ResolveGroup {
            group_id,
            approved_result_id,
            reason,
        } => Response::Results(
            engine
                .resolve_group(&group_id, actor, &approved_result_id, &reason)
                .await?,
        ),
        Request::ListDuplicateGroups => Response::Groups(engine.list_duplicate_groups().await?),
        Request::GetGroup { group_id } => Response::Results(engine.get_group(&group_id).await?),
        Request::GetResult { result_id } => Response::Result(engine.get_result(&result_id).await?),
        Request::Compare { filter } => Response::Comparison(engine.compare(&filter).await?),
        Request::ListNotifications => Response::Notifications(engine.list_notifications(&actor.id).await?),
        Request::UnreadCount => Response::Count(engine.unread_count(&actor.id).await?),
        Request::MarkRead { notification_id } => {
            engine.mark_read(&notification_id, &actor.id).await?;
            Response::Done
        }
        Request::MarkAllRead => {
            let updated = engine.mark_all_read(&actor.id).await?;
            Response::Count(i64::try_from(updated).unwrap_or(i64::MAX))
        }
        Request::DeleteNotification { notification_id } => {
            engine.delete_notification(&notification_id, &actor.id).await?;
            Response::Done
        }
    };

    Ok(response)
}

/// Like `handle_request`, but folds errors into an `ErrorBody` for the wire.
pub async fn handle_json(engine: &Engine, actor: &Actor, body: &str) -> Result<Response, ErrorBody> {
    let request: Request = serde_json::from_str(body).map_err(|e| ErrorBody {
        code: "validation_error",
        message: format!("malformed request: {}", e),
        retryable: false,
    })?;

    handle_request(engine, actor, request).await.map_err(|e| {
        warn!("Request failed for {}: {}", actor.id, e);
        ErrorBody::from(&e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_request_parses() {
        let request: Request = serde_json::from_str(
            r#"{"op":"transition","result_id":"r1","action":"flag","reason":"smudged form"}"#,
        )
        .unwrap();
        match request {
            Request::Transition { result_id, action, reason } => {
                assert_eq!(result_id, "r1");
                assert_eq!(
                    action.with_reason(reason),
                    VerificationAction::Flag("smudged form".into())
                );
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_missing_reason_becomes_empty() {
        let request: Request =
            serde_json::from_str(r#"{"op":"transition","result_id":"r1","action":"reject"}"#).unwrap();
        if let Request::Transition { action, reason, .. } = request {
            assert_eq!(action.with_reason(reason), VerificationAction::Reject(String::new()));
        }
    }

    #[test]
    fn test_compare_filter_defaults() {
        let request: Request = serde_json::from_str(r#"{"op":"compare"}"#).unwrap();
        assert_eq!(request.name(), "compare");
    }

    #[test]
    fn test_error_body_marks_conflicts_retryable() {
        let body = ErrorBody::from(&EngineError::Conflict("race".into()));
        assert_eq!(body.code, "conflict_error");
        assert!(body.retryable);
    }
}
