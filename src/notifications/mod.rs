pub mod event;
pub mod outbox;
pub mod registry;

pub use event::{PushEvent, PushKind, StateChange};
pub use outbox::Outbox;
pub use registry::{ConnectionRegistry, PushReceiver, PushReport};

use std::sync::Arc;

use log::{error, info, warn};
use serde_json::{json, Value};

use crate::db::Database;
use crate::errors::EngineError;
use crate::models::{Notification, NotificationCategory, ResultStatus, Severity, TallyResult};

/// Turns state changes into stored notifications and live pushes.
///
/// The stored row is the durable record; pushes are best effort and a client
/// that was offline recovers by listing its unread notifications. Nothing in
/// here ever fails the operation that raised the event.
pub struct Dispatcher {
    db: Arc<Database>,
    registry: ConnectionRegistry,
    admin_ids: Vec<String>,
}

struct Plan {
    notifications: Vec<Notification>,
    broadcasts: Vec<PushEvent>,
    refresh_analytics: bool,
}

impl Dispatcher {
    pub fn new(db: Arc<Database>, admin_ids: Vec<String>) -> Self {
        Self {
            db,
            registry: ConnectionRegistry::new(),
            admin_ids,
        }
    }

    pub fn connect(&self, user_id: &str) -> (String, PushReceiver) {
        self.registry.connect(user_id)
    }

    pub fn disconnect(&self, connection_id: &str) {
        self.registry.disconnect(connection_id)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Persist and push everything `change` implies. Returns how many
    /// notifications were stored.
    pub async fn dispatch(&self, change: StateChange) -> usize {
        let plan = self.plan(&change);
        let mut stored = 0;

        for notification in plan.notifications {
            if let Err(e) = self.db.insert_notification(&notification).await {
                error!(
                    "Failed to store notification for user {}: {}",
                    notification.target_user_id, e
                );
                continue;
            }
            stored += 1;

            match serde_json::to_value(&notification) {
                Ok(data) => {
                    let report = self
                        .registry
                        .push_to_user(&notification.target_user_id, &PushEvent::new(PushKind::Notification, data));
                    if report.dropped > 0 {
                        warn!(
                            "Live push of notification {} dropped for {} session(s)",
                            notification.id, report.dropped
                        );
                    }
                }
                Err(e) => warn!("Could not encode notification {} for push: {}", notification.id, e),
            }
        }

        for event in plan.broadcasts {
            self.registry.broadcast(&event);
        }

        if plan.refresh_analytics {
            self.publish_analytics().await;
        }

        stored
    }

    /// Broadcast current status counts to every observer.
    pub async fn publish_analytics(&self) {
        match self.db.status_counts().await {
            Ok(counts) => {
                self.broadcast(PushKind::AnalyticsUpdate, json!({ "status_counts": counts }));
            }
            Err(e) => warn!("Skipping analytics update, counts unavailable: {}", e),
        }
    }

    pub fn broadcast(&self, kind: PushKind, data: Value) -> PushReport {
        self.registry.broadcast(&PushEvent::new(kind, data))
    }

    fn to_admins(
        &self,
        title: &str,
        message: &str,
        severity: Severity,
        category: NotificationCategory,
        related: Option<&str>,
    ) -> Vec<Notification> {
        self.admin_ids
            .iter()
            .map(|admin| {
                Notification::new(
                    admin.as_str(),
                    title,
                    message,
                    severity,
                    category,
                    related.map(String::from),
                )
            })
            .collect()
    }

    fn plan(&self, change: &StateChange) -> Plan {
        match change {
            StateChange::ResultSubmitted { result, detection } => {
                let mut notifications = vec![Notification::new(
                    result.submitter_id.as_str(),
                    "Result received",
                    format!(
                        "Your {} result for polling center {} was received and is pending verification.",
                        result.category(),
                        result.polling_center_id
                    ),
                    Severity::Info,
                    NotificationCategory::Result,
                    Some(result.id.clone()),
                )];

                if let Some(detection) = detection {
                    notifications.extend(self.to_admins(
                        "Possible duplicate result",
                        &format!(
                            "Result {} for polling center {} ({}) joined duplicate group {}: {}",
                            result.id,
                            result.polling_center_id,
                            result.category(),
                            detection.group_id,
                            detection.reason
                        ),
                        Severity::Warning,
                        NotificationCategory::Duplicate,
                        Some(result.id.as_str()),
                    ));
                }

                Plan {
                    notifications,
                    broadcasts: vec![PushEvent::new(PushKind::NewResult, result_json(result))],
                    refresh_analytics: true,
                }
            }
            StateChange::StatusChanged {
                result,
                previous,
                actor_id,
            } => {
                let (title, severity) = match result.status {
                    ResultStatus::Verified => ("Result verified", Severity::Success),
                    ResultStatus::Flagged => ("Result flagged", Severity::Warning),
                    ResultStatus::Rejected => ("Result rejected", Severity::Error),
                    ResultStatus::Pending => ("Result reopened", Severity::Info),
                };
                let suffix = result
                    .status_reason
                    .as_deref()
                    .map(|r| format!(": {}", r))
                    .unwrap_or_default();

                let mut notifications = vec![Notification::new(
                    result.submitter_id.as_str(),
                    title,
                    format!(
                        "Your {} result for polling center {} was {}{}",
                        result.category(),
                        result.polling_center_id,
                        result.status,
                        suffix
                    ),
                    severity,
                    NotificationCategory::Verification,
                    Some(result.id.clone()),
                )];

                // Flagged results are escalated for admin review
                if result.status == ResultStatus::Flagged {
                    notifications.extend(self.to_admins(
                        "Result flagged for review",
                        &format!(
                            "{} flagged result {} for polling center {}{}",
                            actor_id, result.id, result.polling_center_id, suffix
                        ),
                        Severity::Warning,
                        NotificationCategory::Verification,
                        Some(result.id.as_str()),
                    ));
                }

                Plan {
                    notifications,
                    broadcasts: vec![PushEvent::new(
                        PushKind::ResultStatusChanged,
                        json!({ "result": result_json(result), "previous_status": previous }),
                    )],
                    refresh_analytics: true,
                }
            }
            StateChange::GroupResolved {
                group_id,
                approved_result_id,
                reason,
                actor_id,
            } => Plan {
                notifications: self.to_admins(
                    "Duplicate group resolved",
                    &format!(
                        "{} resolved duplicate group {} in favour of result {}: {}",
                        actor_id, group_id, approved_result_id, reason
                    ),
                    Severity::Info,
                    NotificationCategory::Duplicate,
                    Some(approved_result_id.as_str()),
                ),
                broadcasts: Vec::new(),
                refresh_analytics: false,
            },
            StateChange::ComplaintStatusChanged {
                complaint_id,
                complainant_id,
                status,
            } => Plan {
                notifications: vec![Notification::new(
                    complainant_id.as_str(),
                    "Complaint updated",
                    format!("Your complaint {} is now {}.", complaint_id, status),
                    Severity::Info,
                    NotificationCategory::Complaint,
                    None,
                )],
                broadcasts: Vec::new(),
                refresh_analytics: false,
            },
            StateChange::UserRegistered { user_id, display_name } => Plan {
                notifications: self.to_admins(
                    "New user registered",
                    &format!("{} ({}) registered and is awaiting approval.", display_name, user_id),
                    Severity::Info,
                    NotificationCategory::Account,
                    None,
                ),
                broadcasts: Vec::new(),
                refresh_analytics: false,
            },
        }
    }

    pub async fn list_notifications(&self, user_id: &str) -> Result<Vec<Notification>, EngineError> {
        self.db.list_notifications(user_id).await
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<i64, EngineError> {
        self.db.unread_count(user_id).await
    }

    pub async fn mark_read(&self, id: &str, user_id: &str) -> Result<(), EngineError> {
        self.db.mark_notification_read(id, user_id).await
    }

    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64, EngineError> {
        let updated = self.db.mark_all_notifications_read(user_id).await?;
        info!("Marked {} notification(s) read for user {}", updated, user_id);
        Ok(updated)
    }

    pub async fn delete(&self, id: &str, user_id: &str) -> Result<(), EngineError> {
        self.db.delete_notification(id, user_id).await
    }
}

fn result_json(result: &TallyResult) -> Value {
    serde_json::to_value(result).unwrap_or_default()
}
