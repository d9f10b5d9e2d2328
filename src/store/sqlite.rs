use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, SqlitePool};

use crate::scheduler::{Job, JobId, JobStatus};
use crate::store::{JobStore, StoreError};

/// How long a writer waits on another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_CONNECTIONS: u32 = 4;

const CREATE_JOBS: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    completed_at INTEGER,
    status TEXT NOT NULL,
    parameters TEXT NOT NULL,
    assigned_worker TEXT
)
"#;

const CREATE_QUEUE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs (status, created_at, id)";

/// Timestamps are stored as microseconds since the epoch so that ordering
/// in SQL matches ordering in Rust.
#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    created_at: i64,
    completed_at: Option<i64>,
    status: String,
    parameters: String,
    assigned_worker: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, StoreError> {
        let job_id = row.id;
        let corrupt = |reason: String| StoreError::CorruptRecord { job_id, reason };

        let id = JobId::try_from(row.id).map_err(|e| corrupt(e.to_string()))?;
        let created_at = micros_to_time(row.created_at)
            .ok_or_else(|| corrupt(format!("created_at out of range: {}", row.created_at)))?;
        let completed_at = match row.completed_at {
            Some(micros) => Some(
                micros_to_time(micros)
                    .ok_or_else(|| corrupt(format!("completed_at out of range: {micros}")))?,
            ),
            None => None,
        };
        let status = row.status.parse::<JobStatus>().map_err(corrupt)?;

        Ok(Job {
            id,
            created_at,
            completed_at,
            status,
            parameters: row.parameters,
            assigned_worker: row.assigned_worker,
        })
    }
}

fn micros_to_time(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

/// Ids beyond `i64` were never issued by SQLite.
fn row_id(job_id: JobId) -> Result<i64, StoreError> {
    i64::try_from(job_id).map_err(|_| StoreError::JobNotFound(job_id))
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
    rows.into_iter().map(Job::try_from).collect()
}

/// Job store backed by a SQLite `jobs` table.
///
/// Every state change is a single conditional `UPDATE`, so the scheduler,
/// the `jobfleet job` CLI and workers can share one database file: a claim
/// only succeeds while the row is still `QUEUED`, whichever process gets
/// there first.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if missing) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(BUSY_TIMEOUT)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_JOBS).execute(&pool).await?;
        sqlx::query(CREATE_QUEUE_INDEX).execute(&pool).await?;

        tracing::debug!(path = %path.as_ref().display(), "Opened job database");
        Ok(Self { pool })
    }

    pub async fn submit(&self, parameters: impl Into<String>) -> Result<Job, StoreError> {
        self.submit_at(parameters, Utc::now()).await
    }

    pub async fn submit_at(
        &self,
        parameters: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "INSERT INTO jobs (created_at, status, parameters) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(created_at.timestamp_micros())
        .bind(JobStatus::Queued.to_string())
        .bind(parameters.into())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    /// Record progress reported by a worker or producer.
    ///
    /// The allowed source states are part of the `UPDATE`, so a concurrent
    /// claim or completion is never overwritten.
    pub async fn set_status(&self, job_id: JobId, status: JobStatus) -> Result<Job, StoreError> {
        let sources = JobStatus::sources_of(status);
        if !sources.is_empty() {
            let placeholders = vec!["?"; sources.len()].join(", ");
            let sql = format!(
                "UPDATE jobs SET status = ?, completed_at = COALESCE(?, completed_at) \
                 WHERE id = ? AND status IN ({placeholders}) RETURNING *"
            );
            let completed_at = status
                .is_finished()
                .then(|| Utc::now().timestamp_micros());

            let mut query = sqlx::query_as::<_, JobRow>(&sql)
                .bind(status.to_string())
                .bind(completed_at)
                .bind(row_id(job_id)?);
            for from in &sources {
                query = query.bind(from.to_string());
            }

            if let Some(row) = query.fetch_optional(&self.pool).await? {
                return row.try_into();
            }
        }

        match self.fetch(job_id).await? {
            None => Err(StoreError::JobNotFound(job_id)),
            Some(job) => Err(StoreError::InvalidTransition {
                job_id,
                from: job.status,
                to: status,
            }),
        }
    }

    /// Every job, oldest first.
    pub async fn all(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(row_id(job_id)?)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn list_queued(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status = ? ORDER BY created_at, id",
        )
        .bind(JobStatus::Queued.to_string())
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn mark_assigned(&self, job_id: JobId, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, assigned_worker = ? WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Assigned.to_string())
        .bind(worker_id)
        .bind(row_id(job_id)?)
        .bind(JobStatus::Queued.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.fetch(job_id).await? {
                None => Err(StoreError::JobNotFound(job_id)),
                Some(job) => Err(StoreError::AlreadyAssigned {
                    job_id,
                    status: job.status,
                }),
            };
        }
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.fetch(job_id).await
    }

    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status IN (?, ?) ORDER BY created_at, id",
        )
        .bind(JobStatus::Assigned.to_string())
        .bind(JobStatus::Running.to_string())
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }
}
