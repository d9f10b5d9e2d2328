use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::scheduler::job::{Job, JobId, JobStatus};
use crate::store::StoreError;

/// Job records held in process, for the in-memory store.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    jobs: BTreeMap<JobId, Job>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new queued job with the next free id.
    pub fn submit(&mut self, parameters: String) -> Job {
        self.submit_at(parameters, Utc::now())
    }

    pub fn submit_at(&mut self, parameters: String, created_at: DateTime<Utc>) -> Job {
        let id = self.next_id();
        let job = Job::with_created_at(id, parameters, created_at);
        self.jobs.insert(id, job.clone());
        job
    }

    fn next_id(&self) -> JobId {
        self.jobs.keys().next_back().map_or(1, |last| last + 1)
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// Queued jobs, oldest first with the lowest id breaking ties.
    pub fn queued(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .cloned()
            .collect();
        jobs.sort_by_key(Job::queue_key);
        jobs
    }

    /// Jobs currently held by a worker.
    pub fn active(&self) -> Vec<Job> {
        self.jobs
            .values()
            .filter(|j| j.status.is_active())
            .cloned()
            .collect()
    }

    /// Get all jobs sorted chronologically by creation time
    pub fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by_key(Job::queue_key);
        jobs
    }

    /// Claim a job for a worker. Only a `QUEUED` job can be claimed.
    pub fn mark_assigned(&mut self, id: JobId, worker_id: &str) -> Result<(), StoreError> {
        let job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.status != JobStatus::Queued {
            return Err(StoreError::AlreadyAssigned {
                job_id: id,
                status: job.status,
            });
        }
        job.status = JobStatus::Assigned;
        job.assigned_worker = Some(worker_id.to_string());
        Ok(())
    }

    /// Progress reported from the worker side. See
    /// [`JobStatus::can_transition_to`].
    pub fn set_status(&mut self, id: JobId, status: JobStatus) -> Result<Job, StoreError> {
        let job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                job_id: id,
                from: job.status,
                to: status,
            });
        }
        job.status = status;
        if status.is_finished() {
            job.completed_at = Some(Utc::now());
        }
        Ok(job.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
