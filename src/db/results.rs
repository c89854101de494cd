use std::collections::{BTreeMap, BTreeSet};

use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use super::{fmt_ts, parse_ts, Database};
use crate::errors::EngineError;
use crate::models::{Category, TallyKey, TallyMap, TallyResult, VoteTallies};
use crate::verification::StatusChange;

const RESULT_COLUMNS: &str = "id, polling_center_id, constituency, category, tallies, invalid_votes, \
     total_votes, source, submission_channel, submitter_id, status, status_reason, verified_by, \
     verified_at, created_at, updated_at, is_duplicate, duplicate_group_id, duplicate_reason, \
     related_result_ids";

fn row_to_result(row: &SqliteRow) -> Result<TallyResult, EngineError> {
    let category: Category = row.try_get::<String, _>("category")?.parse()?;
    let votes: TallyMap = serde_json::from_str(&row.try_get::<String, _>("tallies")?)?;
    let related: BTreeSet<String> =
        serde_json::from_str(&row.try_get::<String, _>("related_result_ids")?)?;
    let verified_at = row
        .try_get::<Option<String>, _>("verified_at")?
        .map(|raw| parse_ts(&raw))
        .transpose()?;

    Ok(TallyResult {
        id: row.try_get("id")?,
        polling_center_id: row.try_get("polling_center_id")?,
        constituency: row.try_get("constituency")?,
        tallies: VoteTallies::from_parts(category, votes),
        invalid_votes: row.try_get("invalid_votes")?,
        total_votes: row.try_get("total_votes")?,
        source: row.try_get::<String, _>("source")?.parse()?,
        submission_channel: row.try_get::<String, _>("submission_channel")?.parse()?,
        submitter_id: row.try_get("submitter_id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        status_reason: row.try_get("status_reason")?,
        verified_by: row.try_get("verified_by")?,
        verified_at,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        is_duplicate: row.try_get("is_duplicate")?,
        duplicate_group_id: row.try_get("duplicate_group_id")?,
        duplicate_reason: row.try_get("duplicate_reason")?,
        related_result_ids: related,
    })
}

fn rows_to_results(rows: Vec<SqliteRow>) -> Result<Vec<TallyResult>, EngineError> {
    rows.iter().map(row_to_result).collect()
}

pub async fn insert_result(conn: &mut SqliteConnection, result: &TallyResult) -> Result<(), EngineError> {
    sqlx::query(&format!(
        "INSERT INTO results ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        RESULT_COLUMNS
    ))
    .bind(&result.id)
    .bind(&result.polling_center_id)
    .bind(&result.constituency)
    .bind(result.category().as_str())
    .bind(serde_json::to_string(result.tallies.votes())?)
    .bind(result.invalid_votes)
    .bind(result.total_votes)
    .bind(result.source.as_str())
    .bind(result.submission_channel.as_str())
    .bind(&result.submitter_id)
    .bind(result.status.as_str())
    .bind(&result.status_reason)
    .bind(&result.verified_by)
    .bind(result.verified_at.as_ref().map(fmt_ts))
    .bind(fmt_ts(&result.created_at))
    .bind(fmt_ts(&result.updated_at))
    .bind(result.is_duplicate)
    .bind(&result.duplicate_group_id)
    .bind(&result.duplicate_reason)
    .bind(serde_json::to_string(&result.related_result_ids)?)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn fetch_result(conn: &mut SqliteConnection, id: &str) -> Result<Option<TallyResult>, EngineError> {
    let row = sqlx::query(&format!("SELECT {} FROM results WHERE id = ?", RESULT_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(row_to_result).transpose()
}

/// All results sharing a tally key, oldest first.
pub async fn fetch_by_key(conn: &mut SqliteConnection, key: &TallyKey) -> Result<Vec<TallyResult>, EngineError> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM results WHERE polling_center_id = ? AND category = ? AND source = ? \
         ORDER BY created_at, id",
        RESULT_COLUMNS
    ))
    .bind(&key.polling_center_id)
    .bind(key.category.as_str())
    .bind(key.source.as_str())
    .fetch_all(&mut *conn)
    .await?;

    rows_to_results(rows)
}

pub async fn fetch_group(conn: &mut SqliteConnection, group_id: &str) -> Result<Vec<TallyResult>, EngineError> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM results WHERE duplicate_group_id = ? ORDER BY created_at, id",
        RESULT_COLUMNS
    ))
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await?;

    rows_to_results(rows)
}

/// Persist the duplicate fields of one group member.
pub async fn write_linkage(conn: &mut SqliteConnection, member: &TallyResult) -> Result<(), EngineError> {
    let updated = sqlx::query(
        r#"
        UPDATE results
        SET is_duplicate = ?, duplicate_group_id = ?, duplicate_reason = ?, related_result_ids = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(member.is_duplicate)
    .bind(&member.duplicate_group_id)
    .bind(&member.duplicate_reason)
    .bind(serde_json::to_string(&member.related_result_ids)?)
    .bind(fmt_ts(&member.updated_at))
    .bind(&member.id)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() != 1 {
        return Err(EngineError::Conflict(format!(
            "result {} disappeared while linking its duplicate group",
            member.id
        )));
    }
    Ok(())
}

/// Apply a status change only if the row still holds the expected previous status.
/// Returns false when another writer got there first.
pub async fn apply_status_change(conn: &mut SqliteConnection, change: &StatusChange) -> Result<bool, EngineError> {
    let updated = sqlx::query(
        r#"
        UPDATE results
        SET status = ?, status_reason = ?, verified_by = ?, verified_at = ?, updated_at = ?
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(change.to.as_str())
    .bind(&change.reason)
    .bind(&change.verified_by)
    .bind(change.verified_at.as_ref().map(fmt_ts))
    .bind(fmt_ts(&change.at))
    .bind(&change.result_id)
    .bind(change.from.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(updated.rows_affected() == 1)
}

impl Database {
    pub async fn get_result(&self, id: &str) -> Result<Option<TallyResult>, EngineError> {
        let mut conn = self.pool().acquire().await?;
        fetch_result(&mut conn, id).await
    }

    pub async fn group_members(&self, group_id: &str) -> Result<Vec<TallyResult>, EngineError> {
        let mut conn = self.pool().acquire().await?;
        fetch_group(&mut conn, group_id).await
    }

    /// Snapshot read for reconciliation; filters are optional.
    pub async fn list_results(
        &self,
        category: Option<Category>,
        constituency: Option<&str>,
    ) -> Result<Vec<TallyResult>, EngineError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM results WHERE (?1 IS NULL OR category = ?1) AND (?2 IS NULL OR constituency = ?2) \
             ORDER BY created_at, id",
            RESULT_COLUMNS
        ))
        .bind(category.map(|c| c.as_str()))
        .bind(constituency)
        .fetch_all(self.pool())
        .await?;

        rows_to_results(rows)
    }

    /// Every result that belongs to some duplicate group.
    pub async fn list_grouped(&self) -> Result<Vec<TallyResult>, EngineError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM results WHERE duplicate_group_id IS NOT NULL ORDER BY created_at, id",
            RESULT_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;

        rows_to_results(rows)
    }

    pub async fn status_counts(&self) -> Result<BTreeMap<String, i64>, EngineError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM results GROUP BY status")
            .fetch_all(self.pool())
            .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            counts.insert(row.try_get::<String, _>("status")?, row.try_get::<i64, _>("n")?);
        }
        Ok(counts)
    }
}
