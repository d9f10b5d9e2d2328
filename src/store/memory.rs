use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::scheduler::{Job, JobId, JobStatus};
use crate::store::{JobStore, JobTable, StoreError};

/// Job store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    table: RwLock<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submit(&self, parameters: impl Into<String>) -> Job {
        self.table.write().await.submit(parameters.into())
    }

    pub async fn submit_at(&self, parameters: impl Into<String>, created_at: DateTime<Utc>) -> Job {
        self.table
            .write()
            .await
            .submit_at(parameters.into(), created_at)
    }

    pub async fn set_status(&self, id: JobId, status: JobStatus) -> Result<Job, StoreError> {
        self.table.write().await.set_status(id, status)
    }

    pub async fn all(&self) -> Vec<Job> {
        self.table.read().await.all()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list_queued(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.table.read().await.queued())
    }

    async fn mark_assigned(&self, job_id: JobId, worker_id: &str) -> Result<(), StoreError> {
        self.table.write().await.mark_assigned(job_id, worker_id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.table.read().await.get(job_id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.table.read().await.active())
    }
}
