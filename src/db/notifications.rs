use sqlx::{sqlite::SqliteRow, Row};

use super::{fmt_ts, parse_ts, Database};
use crate::errors::EngineError;
use crate::models::Notification;

fn row_to_notification(row: &SqliteRow) -> Result<Notification, EngineError> {
    Ok(Notification {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        severity: row.try_get::<String, _>("severity")?.parse()?,
        category: row.try_get::<String, _>("category")?.parse()?,
        target_user_id: row.try_get("target_user_id")?,
        related_result_id: row.try_get("related_result_id")?,
        is_read: row.try_get("is_read")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

impl Database {
    pub async fn insert_notification(&self, notification: &Notification) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, title, message, severity, category, target_user_id, related_result_id, is_read, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.severity.as_str())
        .bind(notification.category.as_str())
        .bind(&notification.target_user_id)
        .bind(&notification.related_result_id)
        .bind(notification.is_read)
        .bind(fmt_ts(&notification.created_at))
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Newest first; rowid breaks ties between rows written in the same instant.
    pub async fn list_notifications(&self, user_id: &str) -> Result<Vec<Notification>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, message, severity, category, target_user_id, related_result_id, is_read, created_at
            FROM notifications
            WHERE target_user_id = ?
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_notification).collect()
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<i64, EngineError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE target_user_id = ? AND is_read = FALSE",
        )
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;

        Ok(count)
    }

    pub async fn mark_notification_read(&self, id: &str, user_id: &str) -> Result<(), EngineError> {
        let updated = sqlx::query("UPDATE notifications SET is_read = TRUE WHERE id = ? AND target_user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(self.pool())
            .await?;

        if updated.rows_affected() == 0 {
            return Err(EngineError::not_found("notification", id));
        }
        Ok(())
    }

    pub async fn mark_all_notifications_read(&self, user_id: &str) -> Result<u64, EngineError> {
        let updated = sqlx::query(
            "UPDATE notifications SET is_read = TRUE WHERE target_user_id = ? AND is_read = FALSE",
        )
        .bind(user_id)
        .execute(self.pool())
        .await?;

        Ok(updated.rows_affected())
    }

    pub async fn delete_notification(&self, id: &str, user_id: &str) -> Result<(), EngineError> {
        let deleted = sqlx::query("DELETE FROM notifications WHERE id = ? AND target_user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(self.pool())
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(EngineError::not_found("notification", id));
        }
        Ok(())
    }
}
