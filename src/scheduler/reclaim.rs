use serde::Serialize;

use crate::scheduler::job::{Job, JobStatus};
use crate::worker::Worker;

/// What the reclamation pass should do with a live worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Holding a job that still needs it.
    Busy,
    /// Never had a job, or was adopted without one.
    Idle,
    /// Its job reached a terminal state.
    Finished(JobStatus),
    /// Its claim never persisted or the job now belongs to another worker.
    Orphaned,
}

impl Disposition {
    pub fn should_stop(self) -> bool {
        !matches!(self, Disposition::Busy)
    }
}

/// Decide whether `worker` is still doing useful work.
///
/// `job` is the store's current record for `worker.job_id`, `None` if the
/// store has no such job.
pub fn classify(worker: &Worker, job: Option<&Job>) -> Disposition {
    if worker.job_id.is_none() {
        return Disposition::Idle;
    }
    let Some(job) = job else {
        return Disposition::Orphaned;
    };
    if !job.is_held_by(&worker.id) {
        return Disposition::Orphaned;
    }
    match job.status {
        JobStatus::Done | JobStatus::Failed => Disposition::Finished(job.status),
        JobStatus::Assigned | JobStatus::Running => Disposition::Busy,
        // held_by with QUEUED means the store was edited behind our back
        JobStatus::Queued => Disposition::Orphaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;

    fn job(status: JobStatus, worker: Option<&str>) -> Job {
        let mut job = Job::new(1, String::new());
        job.status = status;
        job.assigned_worker = worker.map(str::to_string);
        job
    }

    #[test]
    fn worker_without_job_is_idle() {
        let mut worker = Worker::launched("w1".into(), 1);
        worker.job_id = None;
        assert_eq!(classify(&worker, None), Disposition::Idle);
    }

    #[test]
    fn worker_on_running_job_is_busy() {
        let worker = Worker::launched("w1".into(), 1);
        assert_eq!(
            classify(&worker, Some(&job(JobStatus::Running, Some("w1")))),
            Disposition::Busy
        );
        assert_eq!(
            classify(&worker, Some(&job(JobStatus::Assigned, Some("w1")))),
            Disposition::Busy
        );
        assert!(!Disposition::Busy.should_stop());
    }

    #[test]
    fn finished_job_releases_worker() {
        let worker = Worker::launched("w1".into(), 1);
        assert_eq!(
            classify(&worker, Some(&job(JobStatus::Done, Some("w1")))),
            Disposition::Finished(JobStatus::Done)
        );
        assert_eq!(
            classify(&worker, Some(&job(JobStatus::Failed, Some("w1")))),
            Disposition::Finished(JobStatus::Failed)
        );
    }

    #[test]
    fn claim_mismatch_is_orphaned() {
        let worker = Worker::launched("w1".into(), 1);
        // claimed by someone else
        assert_eq!(
            classify(&worker, Some(&job(JobStatus::Running, Some("w2")))),
            Disposition::Orphaned
        );
        // claim never landed
        assert_eq!(
            classify(&worker, Some(&job(JobStatus::Queued, None))),
            Disposition::Orphaned
        );
        // job vanished
        assert_eq!(classify(&worker, None), Disposition::Orphaned);
    }
}
