//! SQLite job store backed by an `sqlx` pool.
//!
//! Timestamps are stored as unix milliseconds so that `(status, available_at)`
//! range scans stay on the index.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use super::{JobStore, StatusCounts};
use crate::{JobId, JobRecord, JobStatus, Payload, QueueError, QueueResult};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id              TEXT PRIMARY KEY,
        type            TEXT NOT NULL,
        payload         TEXT NOT NULL,
        attempts        INTEGER NOT NULL DEFAULT 0,
        max_retries     INTEGER NOT NULL DEFAULT 3,
        retry_delay_ms  INTEGER NOT NULL DEFAULT 1000,
        backoff_factor  REAL NOT NULL DEFAULT 2,
        status          TEXT NOT NULL,
        available_at    INTEGER NOT NULL,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL,
        last_error      TEXT NULL
    )
"#;

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_available ON jobs (status, available_at)";

const COLUMNS: &str = "id, type, payload, attempts, max_retries, retry_delay_ms, backoff_factor, \
                       status, available_at, created_at, updated_at, last_error";

/// SQLite-backed job store.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url`, e.g. `sqlite://jobs.db`
    pub async fn connect(url: &str) -> QueueResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database, kept alive on a single connection
    pub async fn in_memory() -> QueueResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the `jobs` table and index if needed
    pub async fn from_pool(pool: SqlitePool) -> QueueResult<Self> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_INDEX).execute(&pool).await?;
        debug!("SQLite job store ready");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn select(&self, sql: &str, bind_now: Option<i64>, limit: Option<i64>) -> QueueResult<Vec<JobRecord>> {
        let mut query = sqlx::query(sql);
        if let Some(now) = bind_now {
            query = query.bind(now);
        }
        if let Some(limit) = limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }
}

fn to_millis(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(column: &str, ms: i64) -> QueueResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| QueueError::Store(format!("{} out of range: {}", column, ms)))
}

fn to_u32(column: &str, value: i64) -> QueueResult<u32> {
    u32::try_from(value).map_err(|_| QueueError::Store(format!("{} out of range: {}", column, value)))
}

fn decode_row(row: &SqliteRow) -> QueueResult<JobRecord> {
    let payload: String = row.try_get("payload")?;
    let payload: Payload = serde_json::from_str(&payload)?;
    let status: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status).map_err(QueueError::Store)?;
    let retry_delay_ms: i64 = row.try_get("retry_delay_ms")?;

    Ok(JobRecord {
        id: JobId::from(row.try_get::<String, _>("id")?),
        job_type: row.try_get("type")?,
        payload,
        attempts: to_u32("attempts", row.try_get("attempts")?)?,
        max_retries: to_u32("max_retries", row.try_get("max_retries")?)?,
        retry_delay_ms: u64::try_from(retry_delay_ms).unwrap_or(0),
        backoff_factor: row.try_get("backoff_factor")?,
        status,
        available_at: from_millis("available_at", row.try_get("available_at")?)?,
        created_at: from_millis("created_at", row.try_get("created_at")?)?,
        updated_at: from_millis("updated_at", row.try_get("updated_at")?)?,
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert(&self, record: &JobRecord) -> QueueResult<()> {
        let payload = serde_json::to_string(&record.payload)?;

        sqlx::query(&format!(
            "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            COLUMNS
        ))
        .bind(record.id.as_str())
        .bind(&record.job_type)
        .bind(payload)
        .bind(i64::from(record.attempts))
        .bind(i64::from(record.max_retries))
        .bind(i64::try_from(record.retry_delay_ms).unwrap_or(i64::MAX))
        .bind(record.backoff_factor)
        .bind(record.status.as_str())
        .bind(to_millis(&record.available_at))
        .bind(to_millis(&record.created_at))
        .bind(to_millis(&record.updated_at))
        .bind(record.last_error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, record: &JobRecord) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = ?1,
                status = ?2,
                available_at = ?3,
                updated_at = ?4,
                last_error = ?5
            WHERE id = ?6
            "#,
        )
        .bind(i64::from(record.attempts))
        .bind(record.status.as_str())
        .bind(to_millis(&record.available_at))
        .bind(to_millis(&record.updated_at))
        .bind(record.last_error.as_deref())
        .bind(record.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(record.id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?1", COLUMNS))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn recoverable(&self) -> QueueResult<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE status IN ('pending', 'running') ORDER BY available_at, created_at",
            COLUMNS
        );
        self.select(&sql, None, None).await
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE status = 'pending' AND available_at <= ?1 \
             ORDER BY available_at, created_at LIMIT ?2",
            COLUMNS
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.select(&sql, Some(to_millis(&now)), Some(limit)).await
    }

    async fn status_counts(&self) -> QueueResult<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            if let Ok(status) = JobStatus::from_str(&status) {
                counts.add(status, u64::try_from(count).unwrap_or(0));
            }
        }
        Ok(counts)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn is_open(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
