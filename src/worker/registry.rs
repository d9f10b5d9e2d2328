use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::JobId;

/// Provider-assigned worker identifier.
pub type WorkerId = String;

/// Last status the provider reported for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Pending,
    Running,
    Stopped,
    Unknown,
}

impl WorkerStatus {
    /// Everything but `Stopped` holds a slot under the concurrency ceiling.
    pub fn is_active(self) -> bool {
        self != WorkerStatus::Stopped
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Pending => write!(f, "PENDING"),
            WorkerStatus::Running => write!(f, "RUNNING"),
            WorkerStatus::Stopped => write!(f, "STOPPED"),
            WorkerStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub launched_at: DateTime<Utc>,
    pub status: WorkerStatus,
    pub job_id: Option<JobId>,
    /// Set once a stop request has been accepted by the provider.
    pub stop_requested_at: Option<DateTime<Utc>>,
}

impl Worker {
    /// A freshly launched worker, counted against the ceiling immediately.
    pub fn launched(id: WorkerId, job_id: JobId) -> Self {
        Self {
            id,
            launched_at: Utc::now(),
            status: WorkerStatus::Pending,
            job_id: Some(job_id),
            stop_requested_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("worker {0} is already registered")]
    DuplicateWorker(WorkerId),

    #[error("worker {0} is not registered")]
    UnknownWorker(WorkerId),
}

/// In-memory bookkeeping of the workers the scheduler believes it owns.
///
/// Owned by a single scheduler instance; there is no interior mutability, so
/// every mutation goes through `&mut self`. Readers outside the scheduler get
/// copies via [`WorkerRegistry::snapshot`].
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, worker: Worker) -> Result<(), RegistryError> {
        if self.workers.contains_key(&worker.id) {
            return Err(RegistryError::DuplicateWorker(worker.id));
        }
        tracing::debug!(worker_id = %worker.id, job_id = ?worker.job_id, "Worker registered");
        self.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    pub fn update_status(&mut self, id: &str, status: WorkerStatus) -> Result<(), RegistryError> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.to_string()))?;
        if worker.status != status {
            tracing::debug!(worker_id = %id, from = %worker.status, to = %status, "Worker status changed");
            worker.status = status;
        }
        Ok(())
    }

    pub fn mark_stop_requested(
        &mut self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.to_string()))?;
        worker.stop_requested_at = Some(at);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<Worker, RegistryError> {
        self.workers
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn count_active(&self) -> usize {
        self.workers.values().filter(|w| w.is_active()).count()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.keys().cloned().collect()
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    /// Copy of every entry, oldest launch first.
    pub fn snapshot(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.launched_at.cmp(&b.launched_at).then(a.id.cmp(&b.id)));
        workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_duplicate_ids() {
        let mut registry = WorkerRegistry::new();
        registry.add(Worker::launched("w1".into(), 1)).unwrap();
        let err = registry.add(Worker::launched("w1".into(), 2)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateWorker("w1".into()));
        assert_eq!(registry.get("w1").unwrap().job_id, Some(1));
    }

    #[test]
    fn update_and_remove_unknown_worker_fail() {
        let mut registry = WorkerRegistry::new();
        assert_eq!(
            registry.update_status("ghost", WorkerStatus::Running),
            Err(RegistryError::UnknownWorker("ghost".into()))
        );
        assert_eq!(
            registry.remove("ghost").unwrap_err(),
            RegistryError::UnknownWorker("ghost".into())
        );
    }

    #[test]
    fn count_active_excludes_stopped() {
        let mut registry = WorkerRegistry::new();
        registry.add(Worker::launched("a".into(), 1)).unwrap();
        registry.add(Worker::launched("b".into(), 2)).unwrap();
        registry.add(Worker::launched("c".into(), 3)).unwrap();
        assert_eq!(registry.count_active(), 3);

        registry.update_status("b", WorkerStatus::Stopped).unwrap();
        registry.update_status("c", WorkerStatus::Unknown).unwrap();
        assert_eq!(registry.count_active(), 2);
        assert_eq!(registry.len(), 3);

        registry.remove("b").unwrap();
        assert_eq!(registry.count_active(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn stop_request_is_recorded() {
        let mut registry = WorkerRegistry::new();
        registry.add(Worker::launched("a".into(), 1)).unwrap();
        let now = Utc::now();
        registry.mark_stop_requested("a", now).unwrap();
        assert_eq!(registry.get("a").unwrap().stop_requested_at, Some(now));
        // still counts until the provider confirms
        assert_eq!(registry.count_active(), 1);
    }

    #[test]
    fn snapshot_is_a_detached_copy() {
        let mut registry = WorkerRegistry::new();
        registry.add(Worker::launched("a".into(), 1)).unwrap();
        let snap = registry.snapshot();
        registry.update_status("a", WorkerStatus::Running).unwrap();
        assert_eq!(snap[0].status, WorkerStatus::Pending);
    }
}
