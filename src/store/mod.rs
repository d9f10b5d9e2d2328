//! Durable job records, as seen by the scheduler.
//!
//! The scheduler only needs [`JobStore`]; producers and workers use the
//! inherent `submit`/`set_status` methods of the concrete stores.

pub mod memory;
pub mod sqlite;
pub mod table;

use async_trait::async_trait;
use thiserror::Error;

use crate::scheduler::{Job, JobId, JobStatus};
use crate::worker::WorkerId;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use table::JobTable;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {job_id} is {status}, not QUEUED")]
    AlreadyAssigned { job_id: JobId, status: JobStatus },

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job store unavailable: {0}")]
    Unavailable(String),

    #[error("job store call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("job store database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt job record {job_id}: {reason}")]
    CorruptRecord { job_id: i64, reason: String },

    #[error("job store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// The job changed underneath the scheduler; not a store failure.
    pub fn is_claim_race(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyAssigned { .. } | StoreError::JobNotFound(_)
        )
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Jobs in `QUEUED`, oldest first, lowest id breaking ties.
    async fn list_queued(&self) -> Result<Vec<Job>, StoreError>;

    /// Claim a queued job for a worker. Fails with `AlreadyAssigned` if the
    /// job has left `QUEUED` since it was listed.
    async fn mark_assigned(&self, job_id: JobId, worker_id: &str) -> Result<(), StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs in `ASSIGNED` or `RUNNING`.
    async fn list_active(&self) -> Result<Vec<Job>, StoreError>;
}

/// Pairing of an active job with the worker recorded on it.
pub fn assignments(jobs: &[Job]) -> Vec<(JobId, WorkerId)> {
    jobs.iter()
        .filter_map(|job| job.assigned_worker.clone().map(|w| (job.id, w)))
        .collect()
}
