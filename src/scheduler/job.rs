use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::WorkerId;

/// Job identifiers are assigned by the job store in submission order.
pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Assigned,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    /// Terminal states: the job will never need a worker again.
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// States in which a worker holds the job.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Assigned | JobStatus::Running)
    }

    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Assigned,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Failed,
    ];

    /// Progress a worker or producer may report.
    ///
    /// Claiming (QUEUED to ASSIGNED) is not a reported transition; it only
    /// happens through `mark_assigned`. Finished jobs are immutable and a
    /// queued job may only be failed (cancelled).
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        match (self, to) {
            (JobStatus::Assigned, JobStatus::Running) => true,
            (JobStatus::Assigned | JobStatus::Running, JobStatus::Done | JobStatus::Failed) => {
                true
            }
            (JobStatus::Queued, JobStatus::Failed) => true,
            (JobStatus::Queued, _)
            | (JobStatus::Assigned, _)
            | (JobStatus::Running, _)
            | (JobStatus::Done, _)
            | (JobStatus::Failed, _) => false,
        }
    }

    /// States from which `to` may be reported.
    pub fn sources_of(to: JobStatus) -> Vec<JobStatus> {
        JobStatus::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Assigned => write!(f, "ASSIGNED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Done => write!(f, "DONE"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "ASSIGNED" => Ok(JobStatus::Assigned),
            "RUNNING" => Ok(JobStatus::Running),
            "DONE" => Ok(JobStatus::Done),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Opaque to the scheduler; handed to the worker through the store.
    pub parameters: String,
    pub assigned_worker: Option<WorkerId>,
}

impl Job {
    pub fn new(id: JobId, parameters: String) -> Self {
        Self::with_created_at(id, parameters, Utc::now())
    }

    pub fn with_created_at(id: JobId, parameters: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            completed_at: None,
            status: JobStatus::Queued,
            parameters,
            assigned_worker: None,
        }
    }

    /// FIFO ordering key: oldest first, lowest id breaks ties.
    pub fn queue_key(&self) -> (DateTime<Utc>, JobId) {
        (self.created_at, self.id)
    }

    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.assigned_worker.as_deref() == Some(worker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_job_is_queued_and_unassigned() {
        let job = Job::new(7, "scan=a".to_string());
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.assigned_worker.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn transition_sources() {
        assert_eq!(JobStatus::sources_of(JobStatus::Running), vec![JobStatus::Assigned]);
        assert_eq!(
            JobStatus::sources_of(JobStatus::Failed),
            vec![JobStatus::Queued, JobStatus::Assigned, JobStatus::Running]
        );
        assert!(JobStatus::sources_of(JobStatus::Assigned).is_empty());
        assert!(JobStatus::sources_of(JobStatus::Queued).is_empty());
    }

    #[test]
    fn queue_key_breaks_ties_on_id() {
        let now = Utc::now();
        let a = Job::with_created_at(2, String::new(), now);
        let b = Job::with_created_at(1, String::new(), now);
        let c = Job::with_created_at(0, String::new(), now + Duration::seconds(1));
        let mut jobs = [a, b, c];
        jobs.sort_by_key(Job::queue_key);
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![1, 2, 0]);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("done".parse::<JobStatus>(), Ok(JobStatus::Done));
        assert_eq!("RUNNING".parse::<JobStatus>(), Ok(JobStatus::Running));
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&JobStatus::Assigned).unwrap();
        assert_eq!(json, "\"ASSIGNED\"");
    }
}
