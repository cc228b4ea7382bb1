//! Durable storage of jobs (spec section 4.6). A single-writer SQL table
//! with indexed status queries, surviving process restart. Concurrency is
//! safe for concurrent readers and one writer per job id; the manager
//! serializes writes per job by construction (one worker owns one job).

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::Result;
use crate::models::{
    DownloadOptions, Job, JobFile, JobMetadataSnapshot, JobProgress, JobStatus,
};

/// Opens (creating if needed) the `SQLite` database at `path` with the pragmas
/// spec section 6 requires, and creates the `downloads` table if absent.
pub async fn open(path: &str) -> Result<SqlitePool> {
    let options: sqlx::sqlite::SqliteConnectOptions = format!("sqlite://{path}")
        .parse()?;
    let options = options
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .pragma("cache_size", "-65536");

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS downloads (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            options_json TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            status TEXT NOT NULL,
            percent REAL NOT NULL DEFAULT 0,
            speed TEXT,
            eta TEXT,
            error_message TEXT,
            file_path TEXT,
            file_size INTEGER,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );",
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_downloads_created_at ON downloads(created_at DESC);")
        .execute(&pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS roadmap_cache (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            data TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            etag TEXT,
            fetched_at TEXT NOT NULL
        );",
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

/// Single-writer durable store of `Job` rows.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let id: String = row.try_get("id")?;
    let options_json: String = row.try_get("options_json")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(Job {
        id: uuid::Uuid::parse_str(&id).map_err(|e| {
            crate::error::CoreError::Storage(sqlx::Error::Decode(e.to_string().into()))
        })?,
        url: row.try_get("url")?,
        options: serde_json::from_str::<DownloadOptions>(&options_json)?,
        metadata: serde_json::from_str::<JobMetadataSnapshot>(&metadata_json)?,
        status: status.parse::<JobStatus>()?,
        progress: JobProgress {
            percent: row.try_get("percent")?,
            speed: row.try_get("speed")?,
            eta: row.try_get("eta")?,
            error_message: row.try_get("error_message")?,
        },
        file: JobFile {
            path: row.try_get("file_path")?,
            size_bytes: row
                .try_get::<Option<i64>, _>("file_size")?
                .map(|v| u64::try_from(v).unwrap_or(0)),
        },
        created_at: parse_ts(&created_at)?,
        started_at: started_at.map(|s| parse_ts(&s)).transpose()?,
        completed_at: completed_at.map(|s| parse_ts(&s)).transpose()?,
    })
}

fn parse_ts(s: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| crate::error::CoreError::Storage(sqlx::Error::Decode(e.to_string().into())))
}

impl JobStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new job row. The job already carries a freshly assigned id
    /// and `created_at` (see `Job::new`).
    pub async fn create(&self, job: &Job) -> Result<()> {
        let options_json = serde_json::to_string(&job.options)?;
        let metadata_json = serde_json::to_string(&job.metadata)?;
        sqlx::query(
            "INSERT INTO downloads
                (id, url, options_json, metadata_json, status, percent, speed, eta,
                 error_message, file_path, file_size, created_at, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&job.url)
        .bind(options_json)
        .bind(metadata_json)
        .bind(job.status.as_str())
        .bind(job.progress.percent)
        .bind(&job.progress.speed)
        .bind(&job.progress.eta)
        .bind(&job.progress.error_message)
        .bind(&job.file.path)
        .bind(job.file.size_bytes.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replaces every mutable field of an existing job.
    pub async fn update(&self, job: &Job) -> Result<()> {
        let metadata_json = serde_json::to_string(&job.metadata)?;
        sqlx::query(
            "UPDATE downloads SET
                metadata_json = ?, status = ?, percent = ?, speed = ?, eta = ?,
                error_message = ?, file_path = ?, file_size = ?, started_at = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(metadata_json)
        .bind(job.status.as_str())
        .bind(job.progress.percent)
        .bind(&job.progress.speed)
        .bind(&job.progress.eta)
        .bind(&job.progress.error_message)
        .bind(&job.file.path)
        .bind(job.file.size_bytes.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Narrow fast-path write for a status transition.
    pub async fn update_status(
        &self,
        id: uuid::Uuid,
        status: JobStatus,
        completed_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE downloads SET status = ?, completed_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(completed_at.map(|t| t.to_rfc3339()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Narrow fast-path write for a progress update.
    pub async fn update_progress(
        &self,
        id: uuid::Uuid,
        percent: f64,
        speed: Option<&str>,
        eta: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE downloads SET percent = ?, speed = ?, eta = ? WHERE id = ?")
            .bind(percent)
            .bind(speed)
            .bind(eta)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_by_id(&self, id: uuid::Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    /// All `pending` jobs, oldest first.
    pub async fn get_pending(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM downloads WHERE status = 'pending' ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Jobs in {downloading, merging}, ordered by `started_at` ascending.
    pub async fn get_active(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM downloads WHERE status IN ('downloading', 'merging') ORDER BY started_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Terminal-status jobs, most recently completed first.
    pub async fn get_history(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM downloads WHERE status IN ('completed', 'failed', 'cancelled')
             ORDER BY completed_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// All non-terminal jobs, oldest first.
    pub async fn get_queue(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM downloads WHERE status NOT IN ('completed', 'failed', 'cancelled')
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Returns the single active (non-terminal) job for `url`, if any. Used
    /// by the manager's `Enqueue` to enforce the at-most-one-active-per-URL
    /// invariant.
    pub async fn exists_active_by_url(&self, url: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT * FROM downloads WHERE url = ? AND status NOT IN ('completed', 'failed', 'cancelled')
             LIMIT 1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    pub async fn delete(&self, id: uuid::Uuid) -> Result<()> {
        sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes all terminal rows only.
    pub async fn clear_history(&self) -> Result<()> {
        sqlx::query("DELETE FROM downloads WHERE status IN ('completed', 'failed', 'cancelled')")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DownloadOptions;

    async fn test_store() -> JobStore {
        let pool = open(":memory:").await.unwrap();
        JobStore::new(pool)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = test_store().await;
        let job = Job::new("https://youtube.com/watch?v=abc".to_string(), DownloadOptions::default());
        store.create(&job).await.unwrap();

        let fetched = store.get_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.url, job.url);
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn exists_active_by_url_finds_non_terminal_only() {
        let store = test_store().await;
        let job = Job::new("https://youtube.com/watch?v=abc".to_string(), DownloadOptions::default());
        store.create(&job).await.unwrap();

        assert!(store.exists_active_by_url(&job.url).await.unwrap().is_some());

        store
            .update_status(job.id, JobStatus::Completed, Some(chrono::Utc::now()))
            .await
            .unwrap();
        assert!(store.exists_active_by_url(&job.url).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_history_orders_by_completed_at_desc() {
        let store = test_store().await;
        let mut first = Job::new("https://youtube.com/watch?v=1".to_string(), DownloadOptions::default());
        let mut second = Job::new("https://youtube.com/watch?v=2".to_string(), DownloadOptions::default());
        first.status = JobStatus::Completed;
        first.completed_at = Some(chrono::Utc::now() - chrono::Duration::seconds(10));
        second.status = JobStatus::Completed;
        second.completed_at = Some(chrono::Utc::now());
        store.create(&first).await.unwrap();
        store.create(&second).await.unwrap();

        let history = store.get_history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id);
    }

    #[tokio::test]
    async fn clear_history_removes_only_terminal_rows() {
        let store = test_store().await;
        let pending = Job::new("https://youtube.com/watch?v=p".to_string(), DownloadOptions::default());
        let mut done = Job::new("https://youtube.com/watch?v=d".to_string(), DownloadOptions::default());
        done.status = JobStatus::Completed;
        done.completed_at = Some(chrono::Utc::now());
        store.create(&pending).await.unwrap();
        store.create(&done).await.unwrap();

        store.clear_history().await.unwrap();

        assert!(store.get_by_id(pending.id).await.unwrap().is_some());
        assert!(store.get_by_id(done.id).await.unwrap().is_none());
    }
}
