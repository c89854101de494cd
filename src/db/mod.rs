pub mod notifications;
pub mod results;

use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    Sqlite, Transaction,
};
use std::str::FromStr;
use std::time::Duration;

use crate::errors::EngineError;

// How long a writer waits on another connection's write lock before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let in_memory = db_url.contains(":memory:");

        // Create database if it doesn't exist
        if !in_memory && !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            info!("Creating database at {}", db_url);
            Sqlite::create_database(db_url).await?;
        }

        let mut connect = SqliteConnectOptions::from_str(db_url)?.busy_timeout(BUSY_TIMEOUT);
        let mut options = SqlitePoolOptions::new().max_connections(max_connections);
        if in_memory {
            // An in-memory database lives exactly as long as its connection
            options = options
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        } else {
            // Readers keep going while one writer commits
            connect = connect.journal_mode(SqliteJournalMode::Wal);
        }
        let pool = options.connect_with(connect).await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory store, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self, EngineError> {
        Self::new("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction that takes the write lock up front.
    ///
    /// A deferred transaction that reads and then writes cannot wait for a
    /// concurrent writer; it fails with `database is locked`. Taking the lock
    /// at `BEGIN` lets the busy timeout queue it instead.
    pub async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, EngineError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS results (
                id TEXT PRIMARY KEY,
                polling_center_id TEXT NOT NULL,
                constituency TEXT NOT NULL,
                category TEXT NOT NULL,
                tallies TEXT NOT NULL,
                invalid_votes INTEGER NOT NULL,
                total_votes INTEGER NOT NULL,
                source TEXT NOT NULL,
                submission_channel TEXT NOT NULL,
                submitter_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                status_reason TEXT,
                verified_by TEXT,
                verified_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_duplicate BOOLEAN NOT NULL DEFAULT FALSE,
                duplicate_group_id TEXT,
                duplicate_reason TEXT,
                related_result_ids TEXT NOT NULL DEFAULT '[]'
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_results_tally_key ON results (polling_center_id, category, source);",
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_results_group ON results (duplicate_group_id);")
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                severity TEXT NOT NULL,
                category TEXT NOT NULL,
                target_user_id TEXT NOT NULL,
                related_result_id TEXT,
                is_read BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_notifications_target ON notifications (target_user_id, is_read);",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

// Fixed-width so that text ordering matches time ordering
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Storage(format!("Failed to parse timestamp {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = parse_ts("2026-10-16T10:00:00.5Z").unwrap();
        let b = parse_ts("2026-10-16T10:00:00.123456Z").unwrap();
        assert!(fmt_ts(&b) < fmt_ts(&a));
        assert_eq!(parse_ts(&fmt_ts(&a)).unwrap(), a);
    }

    #[tokio::test]
    async fn test_in_memory_schema_is_created() {
        let db = Database::in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
