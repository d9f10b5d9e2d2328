use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::worker::provider::{ProviderError, ProviderWorker, WorkerProvider};
use crate::worker::registry::{WorkerId, WorkerStatus};

#[derive(Debug)]
struct SimulatedWorker {
    status: WorkerStatus,
    launched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    workers: HashMap<WorkerId, SimulatedWorker>,
    launch_failures: VecDeque<ProviderError>,
    stop_failures: VecDeque<ProviderError>,
    describe_failures: HashSet<WorkerId>,
    launches: usize,
    stop_calls: HashMap<WorkerId, usize>,
}

/// In-process worker provider.
///
/// Workers start `Pending`, report `Running` on their first describe and
/// `Stopped` once stopped. Nothing is executed. Failures can be queued up
/// to exercise the scheduler's error paths.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    state: Mutex<MemoryState>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `launch` call fails with `error`.
    pub async fn fail_next_launch(&self, error: ProviderError) {
        self.state.lock().await.launch_failures.push_back(error);
    }

    /// The next `stop` call fails with `error`.
    pub async fn fail_next_stop(&self, error: ProviderError) {
        self.state.lock().await.stop_failures.push_back(error);
    }

    /// Toggle transient describe failures for one worker.
    pub async fn fail_describe(&self, id: &str, failing: bool) {
        let mut state = self.state.lock().await;
        if failing {
            state.describe_failures.insert(id.to_string());
        } else {
            state.describe_failures.remove(id);
        }
    }

    /// Force a worker's status, e.g. to simulate it exiting on its own.
    pub async fn set_status(&self, id: &str, status: WorkerStatus) -> bool {
        match self.state.lock().await.workers.get_mut(id) {
            Some(worker) => {
                worker.status = status;
                true
            }
            None => false,
        }
    }

    /// Insert a worker the scheduler did not launch in this process.
    pub async fn adopt(&self, id: &str, status: WorkerStatus) {
        self.state.lock().await.workers.insert(
            id.to_string(),
            SimulatedWorker {
                status,
                launched_at: Utc::now(),
            },
        );
    }

    /// Drop a worker entirely, as if the provider garbage-collected it.
    pub async fn forget(&self, id: &str) {
        self.state.lock().await.workers.remove(id);
    }

    pub async fn status_of(&self, id: &str) -> Option<WorkerStatus> {
        self.state.lock().await.workers.get(id).map(|w| w.status)
    }

    pub async fn launch_count(&self) -> usize {
        self.state.lock().await.launches
    }

    pub async fn stop_calls(&self, id: &str) -> usize {
        self.state
            .lock()
            .await
            .stop_calls
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn live_workers(&self) -> Vec<WorkerId> {
        let state = self.state.lock().await;
        let mut ids: Vec<WorkerId> = state
            .workers
            .iter()
            .filter(|(_, w)| w.status.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl WorkerProvider for MemoryProvider {
    async fn launch(&self) -> Result<WorkerId, ProviderError> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.launch_failures.pop_front() {
            return Err(error);
        }
        let id: WorkerId = format!("mem-{}", &Uuid::new_v4().simple().to_string()[..8]);
        state.workers.insert(
            id.clone(),
            SimulatedWorker {
                status: WorkerStatus::Pending,
                launched_at: Utc::now(),
            },
        );
        state.launches += 1;
        Ok(id)
    }

    async fn describe(&self, id: &str) -> Result<WorkerStatus, ProviderError> {
        let mut state = self.state.lock().await;
        if state.describe_failures.contains(id) {
            return Err(ProviderError::Unavailable(format!(
                "describe of {id} failed"
            )));
        }
        let worker = state
            .workers
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        if worker.status == WorkerStatus::Pending {
            worker.status = WorkerStatus::Running;
            return Ok(WorkerStatus::Pending);
        }
        Ok(worker.status)
    }

    async fn stop(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        *state.stop_calls.entry(id.to_string()).or_insert(0) += 1;
        if let Some(error) = state.stop_failures.pop_front() {
            return Err(error);
        }
        if let Some(worker) = state.workers.get_mut(id) {
            worker.status = WorkerStatus::Stopped;
        }
        Ok(())
    }

    async fn list_owned(&self) -> Result<Vec<ProviderWorker>, ProviderError> {
        let state = self.state.lock().await;
        let mut workers: Vec<ProviderWorker> = state
            .workers
            .iter()
            .map(|(id, w)| ProviderWorker {
                id: id.clone(),
                status: w.status,
                launched_at: w.launched_at,
            })
            .collect();
        workers.sort_by(|a, b| a.launched_at.cmp(&b.launched_at).then(a.id.cmp(&b.id)));
        Ok(workers)
    }
}
