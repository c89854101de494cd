mod locks;

pub use locks::KeyedLocks;

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{Config, DuplicatePolicy, ReconThresholds};
use crate::db::{results, Database};
use crate::duplicates::{self, DuplicateGroup};
use crate::errors::{EngineError, EngineResult};
use crate::models::{self, Actor, Category, NewResult, Notification, ResultSource, ResultStatus, TallyResult};
use crate::notifications::{Dispatcher, Outbox, StateChange};
use crate::reconciliation::{self, ComparisonRow};
use crate::verification::{self, VerificationAction};

/// Optional narrowing for `Engine::compare`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompareFilter {
    pub category: Option<Category>,
    pub constituency: Option<String>,
}

/// The verification and reconciliation core.
///
/// Only this type writes result rows. Writers for one tally key are serialized
/// by `KeyedLocks` and each runs as a single store transaction; notifications
/// are queued after commit and dispatched in the background, so they can
/// never undo, fail or delay the write.
pub struct Engine {
    db: Arc<Database>,
    dispatcher: Arc<Dispatcher>,
    outbox: Outbox,
    locks: KeyedLocks,
    duplicates: DuplicatePolicy,
    thresholds: ReconThresholds,
}

impl Engine {
    /// Must be called from within a Tokio runtime, which hosts the
    /// notification worker.
    pub fn new(db: Arc<Database>, dispatcher: Arc<Dispatcher>, config: &Config) -> Self {
        Self {
            db,
            outbox: Outbox::spawn(Arc::clone(&dispatcher)),
            dispatcher,
            locks: KeyedLocks::new(),
            duplicates: config.duplicates.clone(),
            thresholds: config.thresholds,
        }
    }

    /// Open the store named in `config` and wire up a dispatcher.
    pub async fn from_config(config: &Config) -> EngineResult<Self> {
        let db = Arc::new(Database::new(&config.database_url, config.max_connections).await?);
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&db), config.admin_ids.clone()));
        Ok(Self::new(db, dispatcher, config))
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn thresholds(&self) -> &ReconThresholds {
        &self.thresholds
    }

    /// Wait until notifications for every write so far have been dispatched.
    pub async fn flush_notifications(&self) {
        self.outbox.flush().await
    }

    /// Validate, link into a duplicate group if needed, and store as `pending`.
    pub async fn submit_result(&self, actor: &Actor, submission: NewResult) -> EngineResult<TallyResult> {
        submission.validate()?;
        if submission.source == ResultSource::Official {
            verification::authorize(actor, "submit official results")?;
        }

        let result = TallyResult::new(submission, actor.id.clone());
        let key = result.key();

        let (stored, detection) = {
            let _guard = self.locks.lock(&key).await;
            let mut tx = self.db.begin_write().await?;

            let siblings = results::fetch_by_key(&mut *tx, &key).await?;
            let outcome = match duplicates::detect(&self.duplicates, &result, &siblings) {
                Some(linkage) => {
                    results::insert_result(&mut *tx, &linkage.new_result).await?;
                    for sibling in &linkage.siblings {
                        results::write_linkage(&mut *tx, sibling).await?;
                    }
                    (linkage.new_result, Some(linkage.detection))
                }
                None => {
                    results::insert_result(&mut *tx, &result).await?;
                    (result, None)
                }
            };

            tx.commit().await?;
            outcome
        };

        match &detection {
            Some(d) => warn!(
                "Result {} for {} joined duplicate group {} ({} related): {}",
                stored.id,
                key,
                d.group_id,
                d.related_ids.len(),
                d.reason
            ),
            None => info!("Accepted result {} for {} from {}", stored.id, key, stored.submitter_id),
        }

        self.outbox.send(StateChange::ResultSubmitted {
            result: stored.clone(),
            detection,
        });

        Ok(stored)
    }

    /// Move a pending result to verified, flagged or rejected, or reject a
    /// verified member of an open duplicate group.
    pub async fn transition(
        &self,
        result_id: &str,
        actor: &Actor,
        action: VerificationAction,
    ) -> EngineResult<TallyResult> {
        let key = self
            .db
            .get_result(result_id)
            .await?
            .ok_or_else(|| EngineError::not_found("result", result_id))?
            .key();

        let (updated, previous) = {
            let _guard = self.locks.lock(&key).await;
            let mut tx = self.db.begin_write().await?;

            let current = results::fetch_result(&mut *tx, result_id)
                .await?
                .ok_or_else(|| EngineError::not_found("result", result_id))?;
            let group = match current.duplicate_group_id.as_deref() {
                Some(group_id) => Some(DuplicateGroup::new(
                    group_id,
                    results::fetch_group(&mut *tx, group_id).await?,
                )),
                None => None,
            };
            let change =
                verification::plan_transition(&current, group.as_ref(), actor, &action, models::now())?;

            if change.to == ResultStatus::Verified {
                let same_key = results::fetch_by_key(&mut *tx, &key).await?;
                verification::check_single_verified(&current, &same_key)?;
            }

            if !results::apply_status_change(&mut *tx, &change).await? {
                return Err(EngineError::Conflict(format!(
                    "result {} changed while it was being {}",
                    result_id, change.to
                )));
            }
            tx.commit().await?;

            let previous = current.status;
            let mut updated = current;
            change.apply_to(&mut updated);
            (updated, previous)
        };

        info!(
            "Result {} moved {} -> {} by {}",
            updated.id, previous, updated.status, actor.id
        );

        self.outbox.send(StateChange::StatusChanged {
            result: updated.clone(),
            previous,
            actor_id: actor.id.clone(),
        });

        Ok(updated)
    }

    /// Settle a duplicate group on one member and reject the others, atomically.
    pub async fn resolve_group(
        &self,
        group_id: &str,
        actor: &Actor,
        approved_result_id: &str,
        reason: &str,
    ) -> EngineResult<Vec<TallyResult>> {
        verification::authorize(actor, "resolve duplicate groups")?;
        let reason = verification::require_reason(reason, "resolve a duplicate group")?;

        let key = self
            .db
            .group_members(group_id)
            .await?
            .first()
            .map(TallyResult::key)
            .ok_or_else(|| EngineError::not_found("duplicate group", group_id))?;

        let (group, changes) = {
            let _guard = self.locks.lock(&key).await;
            let mut tx = self.db.begin_write().await?;

            let members = results::fetch_group(&mut *tx, group_id).await?;
            if members.is_empty() {
                return Err(EngineError::not_found("duplicate group", group_id));
            }
            let mut group = DuplicateGroup::new(group_id, members);
            let same_key = results::fetch_by_key(&mut *tx, &key).await?;
            let changes = verification::plan_resolution(
                &group,
                &same_key,
                approved_result_id,
                &reason,
                actor,
                models::now(),
            )?;

            for change in &changes {
                if !results::apply_status_change(&mut *tx, change).await? {
                    // Dropping the transaction rolls back the changes already applied
                    return Err(EngineError::Conflict(format!(
                        "result {} in duplicate group {} changed during resolution",
                        change.result_id, group_id
                    )));
                }
            }
            tx.commit().await?;

            for change in &changes {
                if let Some(member) = group.members.iter_mut().find(|m| m.id == change.result_id) {
                    change.apply_to(member);
                }
            }
            (group, changes)
        };

        info!(
            "Duplicate group {} resolved on {} by {} ({} transition(s))",
            group_id,
            approved_result_id,
            actor.id,
            changes.len()
        );

        for change in &changes {
            if let Some(member) = group.get(&change.result_id) {
                self.outbox.send(StateChange::StatusChanged {
                    result: member.clone(),
                    previous: change.from,
                    actor_id: actor.id.clone(),
                });
            }
        }
        self.outbox.send(StateChange::GroupResolved {
            group_id: group_id.to_string(),
            approved_result_id: approved_result_id.to_string(),
            reason,
            actor_id: actor.id.clone(),
        });

        Ok(group.members)
    }

    pub async fn get_result(&self, result_id: &str) -> EngineResult<TallyResult> {
        self.db
            .get_result(result_id)
            .await?
            .ok_or_else(|| EngineError::not_found("result", result_id))
    }

    pub async fn list_duplicate_groups(&self) -> EngineResult<BTreeMap<String, Vec<TallyResult>>> {
        let grouped = duplicates::group_results(self.db.list_grouped().await?);
        Ok(grouped
            .into_iter()
            .map(|(id, group)| (id, group.members))
            .collect())
    }

    pub async fn get_group(&self, group_id: &str) -> EngineResult<Vec<TallyResult>> {
        let members = self.db.group_members(group_id).await?;
        if members.is_empty() {
            return Err(EngineError::not_found("duplicate group", group_id));
        }
        Ok(DuplicateGroup::new(group_id, members).members)
    }

    /// Internal vs official comparison over a fresh snapshot of the store.
    /// Takes no locks; a later call may see newer totals.
    pub async fn compare(&self, filter: &CompareFilter) -> EngineResult<Vec<ComparisonRow>> {
        let snapshot = self
            .db
            .list_results(filter.category, filter.constituency.as_deref())
            .await?;
        let (internal, official): (Vec<TallyResult>, Vec<TallyResult>) = snapshot
            .into_iter()
            .partition(|r| r.source == ResultSource::Internal);

        Ok(reconciliation::compare(&internal, &official, &self.thresholds))
    }

    pub async fn list_notifications(&self, user_id: &str) -> EngineResult<Vec<Notification>> {
        self.dispatcher.list_notifications(user_id).await
    }

    pub async fn unread_count(&self, user_id: &str) -> EngineResult<i64> {
        self.dispatcher.unread_count(user_id).await
    }

    pub async fn mark_read(&self, notification_id: &str, user_id: &str) -> EngineResult<()> {
        self.dispatcher.mark_read(notification_id, user_id).await
    }

    pub async fn mark_all_read(&self, user_id: &str) -> EngineResult<u64> {
        self.dispatcher.mark_all_read(user_id).await
    }

    pub async fn delete_notification(&self, notification_id: &str, user_id: &str) -> EngineResult<()> {
        self.dispatcher.delete(notification_id, user_id).await
    }
}
