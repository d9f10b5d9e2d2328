use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, SchedulerConfig, ShutdownPolicy};
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::reclaim::{classify, Disposition};
use crate::store::{self, JobStore, StoreError};
use crate::worker::{
    ProviderError, ProviderWorker, Worker, WorkerId, WorkerProvider, WorkerRegistry,
    WorkerStatus,
};

/// Failures that keep a tick (or registry rebuild) from making any progress.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("job store unreachable: {0}")]
    JobStore(#[source] StoreError),

    #[error("worker provider unreachable: {0}")]
    Provider(#[source] ProviderError),
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Queued jobs seen at the start of assignment.
    pub queued: usize,
    pub launched: usize,
    /// Launches whose job claim was persisted.
    pub claimed: usize,
    pub launch_failures: usize,
    /// Launches whose job claim failed; the worker is left for reclamation.
    pub claim_failures: usize,
    /// Workers found holding a claim that no longer matches the store.
    pub orphaned: usize,
    /// Live workers the provider reported that the registry did not track.
    pub adopted: usize,
    pub stop_requested: usize,
    pub removed: usize,
    /// Registry invariant violations that were logged and skipped.
    pub anomalies: usize,
    /// Active workers once the tick finished.
    pub active: usize,
}

/// Read-only view of the scheduler published after every tick.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub scheduler_id: String,
    pub ceiling: usize,
    pub active: usize,
    pub ticks: u64,
    pub recovered: bool,
    pub workers: Vec<Worker>,
    pub last_tick: Option<TickReport>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SchedulerSnapshot {
    fn initial(config: &SchedulerConfig) -> Self {
        Self {
            scheduler_id: config.scheduler_id.clone(),
            ceiling: config.concurrency_ceiling,
            active: 0,
            ticks: 0,
            recovered: false,
            workers: Vec::new(),
            last_tick: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

async fn bounded_store<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}

async fn bounded_provider<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(ProviderError::Timeout(limit)))
}

/// The reconciliation loop.
///
/// Each tick observes worker status, reclaims workers that are stopped or no
/// longer useful, then hands queued jobs (oldest first) to newly launched
/// workers while the number of active workers stays under the ceiling.
/// Ticks never overlap and the registry has a single writer: this struct.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    provider: Arc<dyn WorkerProvider>,
    registry: WorkerRegistry,
    ticks: u64,
    recovered: bool,
    snapshot_tx: watch::Sender<SchedulerSnapshot>,
}

impl Scheduler {
    /// Fails only on invalid configuration; nothing is contacted yet.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        provider: Arc<dyn WorkerProvider>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (snapshot_tx, _) = watch::channel(SchedulerSnapshot::initial(&config));
        Ok(Self {
            config,
            store,
            provider,
            registry: WorkerRegistry::new(),
            ticks: 0,
            recovered: false,
            snapshot_tx,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn count_active(&self) -> usize {
        self.registry.count_active()
    }

    /// Copies of the tracked workers.
    pub fn workers(&self) -> Vec<Worker> {
        self.registry.snapshot()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Receive a fresh [`SchedulerSnapshot`] after every tick.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Rebuild the registry from the provider's view of this scheduler's
    /// workers, matched against the jobs the store says are held.
    ///
    /// Returns the number of workers adopted. Workers without a matching job
    /// are adopted idle and reclaimed by the next tick.
    pub async fn recover(&mut self) -> Result<usize, TickError> {
        let limit = self.config.call_timeout;
        let owned = bounded_provider(limit, self.provider.list_owned())
            .await
            .map_err(TickError::Provider)?;
        let held = bounded_store(limit, self.store.list_active())
            .await
            .map_err(TickError::JobStore)?;

        let mut anomalies = 0;
        let adopted = self.adopt(owned, &held, &mut anomalies);

        for (job_id, worker_id) in store::assignments(&held) {
            if self.registry.get(&worker_id).is_none() {
                tracing::warn!(
                    job_id,
                    worker_id = %worker_id,
                    "Job is held by a worker the provider does not report as live"
                );
            }
        }

        self.recovered = true;
        self.publish(None, None);
        Ok(adopted)
    }

    /// Register live provider workers the registry does not track yet, each
    /// paired with the job the store says it holds (if any).
    fn adopt(&mut self, owned: Vec<ProviderWorker>, held: &[Job], anomalies: &mut usize) -> usize {
        let assignments = store::assignments(held);
        let mut adopted = 0;
        for found in owned {
            if !found.status.is_active() || self.registry.get(&found.id).is_some() {
                continue;
            }
            let job_id = assignments
                .iter()
                .find(|(_, worker_id)| *worker_id == found.id)
                .map(|(job_id, _)| *job_id);
            let worker = Worker {
                id: found.id.clone(),
                launched_at: found.launched_at,
                status: found.status,
                job_id,
                stop_requested_at: None,
            };
            match self.registry.add(worker) {
                Ok(()) => {
                    adopted += 1;
                    tracing::info!(worker_id = %found.id, job_id = ?job_id, status = %found.status, "Adopted worker");
                }
                Err(e) => {
                    *anomalies += 1;
                    tracing::warn!(error = %e, "Registry anomaly while adopting worker");
                }
            }
        }
        adopted
    }

    /// Run one reconciliation pass.
    ///
    /// Per-job and per-worker failures are logged and counted in the report;
    /// only an unreachable job store aborts the tick.
    pub async fn tick(&mut self) -> Result<TickReport, TickError> {
        let mut report = TickReport::default();

        self.refresh_statuses(&mut report).await;
        self.reclaim(&mut report).await;
        let outcome = self.assign(&mut report).await;

        report.active = self.registry.count_active();
        self.ticks += 1;

        let error = outcome.as_ref().err().map(|e| e.to_string());
        self.publish(Some(report.clone()), error);
        outcome.map(|()| report)
    }

    /// Refresh every tracked worker's status. Lookups run concurrently;
    /// results are applied to the registry one at a time.
    async fn refresh_statuses(&mut self, report: &mut TickReport) {
        let limit = self.config.call_timeout;
        let mut lookups = JoinSet::new();
        for id in self.registry.ids() {
            let provider = Arc::clone(&self.provider);
            lookups.spawn(async move {
                let status = bounded_provider(limit, provider.describe(&id)).await;
                (id, status)
            });
        }

        while let Some(joined) = lookups.join_next().await {
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "Worker status lookup task failed");
                    continue;
                }
            };
            let status = match result {
                Ok(status) => status,
                Err(ProviderError::NotFound(_)) => {
                    tracing::debug!(worker_id = %id, "Provider no longer knows worker, treating as stopped");
                    WorkerStatus::Stopped
                }
                Err(e) => {
                    tracing::warn!(worker_id = %id, error = %e, "Failed to describe worker, keeping last known status");
                    continue;
                }
            };
            if let Err(e) = self.registry.update_status(&id, status) {
                report.anomalies += 1;
                tracing::warn!(error = %e, "Registry anomaly while refreshing status");
            }
        }

        self.adopt_untracked(report).await;
    }

    /// Track live workers the provider reports but the registry does not
    /// know, such as a launch that completed after its call timed out. They
    /// hold a slot from now on and, having no job, are reclaimed.
    async fn adopt_untracked(&mut self, report: &mut TickReport) {
        let limit = self.config.call_timeout;
        let owned = match bounded_provider(limit, self.provider.list_owned()).await {
            Ok(owned) => owned,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list provider workers, skipping adoption");
                return;
            }
        };
        let untracked = owned
            .iter()
            .any(|w| w.status.is_active() && self.registry.get(&w.id).is_none());
        if !untracked {
            return;
        }

        let held = match bounded_store(limit, self.store.list_active()).await {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list held jobs, leaving untracked workers for next tick");
                return;
            }
        };
        let adopted = self.adopt(owned, &held, &mut report.anomalies);
        if adopted > 0 {
            report.adopted += adopted;
            tracing::warn!(adopted, "Provider reported workers this scheduler was not tracking");
        }
    }

    /// Remove stopped workers, then ask the provider to stop the ones with
    /// nothing left to do. Candidates are collected before anything is
    /// mutated.
    async fn reclaim(&mut self, report: &mut TickReport) {
        let limit = self.config.call_timeout;
        let now = Utc::now();

        let mut removals: Vec<WorkerId> = Vec::new();
        let mut candidates: Vec<Worker> = Vec::new();
        for worker in self.registry.workers() {
            if worker.status == WorkerStatus::Stopped {
                removals.push(worker.id.clone());
                continue;
            }
            if let Some(requested_at) = worker.stop_requested_at {
                let overdue = (now - requested_at)
                    .to_std()
                    .map_or(false, |waited| waited >= self.config.stop_retry_after);
                if !overdue {
                    continue;
                }
            }
            candidates.push(worker.clone());
        }

        for id in removals {
            match self.registry.remove(&id) {
                Ok(worker) => {
                    report.removed += 1;
                    tracing::info!(worker_id = %worker.id, job_id = ?worker.job_id, "Worker stopped, slot released");
                }
                Err(e) => {
                    report.anomalies += 1;
                    tracing::warn!(error = %e, "Registry anomaly while removing worker");
                }
            }
        }

        let mut stops: Vec<(WorkerId, Option<Disposition>)> = Vec::new();
        for worker in candidates {
            if worker.stop_requested_at.is_some() {
                tracing::warn!(worker_id = %worker.id, "Worker ignored its stop request, re-issuing");
                stops.push((worker.id, None));
                continue;
            }
            let job = match worker.job_id {
                None => None,
                Some(job_id) => match bounded_store(limit, self.store.get(job_id)).await {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::warn!(
                            worker_id = %worker.id,
                            job_id,
                            error = %e,
                            "Could not look up job, leaving worker alone this tick"
                        );
                        continue;
                    }
                },
            };
            let disposition = classify(&worker, job.as_ref());
            if disposition == Disposition::Orphaned {
                report.orphaned += 1;
                tracing::warn!(
                    worker_id = %worker.id,
                    job_id = ?worker.job_id,
                    "Orphaned worker: its job claim does not point back at it"
                );
            }
            if disposition.should_stop() {
                stops.push((worker.id, Some(disposition)));
            }
        }

        for (id, disposition) in stops {
            match bounded_provider(limit, self.provider.stop(&id)).await {
                Ok(()) => {
                    report.stop_requested += 1;
                    if let Err(e) = self.registry.mark_stop_requested(&id, Utc::now()) {
                        report.anomalies += 1;
                        tracing::warn!(error = %e, "Registry anomaly while recording stop");
                    }
                    tracing::info!(worker_id = %id, reason = ?disposition, "Requested worker stop");
                }
                Err(e) => {
                    tracing::warn!(worker_id = %id, error = %e, "Stop request failed, retrying next tick");
                }
            }
        }
    }

    /// Launch a worker for each queued job, oldest first, until the ceiling
    /// is reached.
    async fn assign(&mut self, report: &mut TickReport) -> Result<(), TickError> {
        let limit = self.config.call_timeout;
        let mut queued = bounded_store(limit, self.store.list_queued())
            .await
            .map_err(TickError::JobStore)?;
        queued.retain(|job| job.status == JobStatus::Queued);
        queued.sort_by_key(Job::queue_key);
        report.queued = queued.len();

        let mut available = self
            .config
            .concurrency_ceiling
            .saturating_sub(self.registry.count_active());
        if available == 0 {
            if !queued.is_empty() {
                tracing::debug!(queued = queued.len(), "At concurrency ceiling, waiting for capacity");
            }
            return Ok(());
        }

        for job in queued {
            if available == 0 {
                break;
            }

            let worker_id = match bounded_provider(limit, self.provider.launch()).await {
                Ok(id) => id,
                Err(e) => {
                    report.launch_failures += 1;
                    if e.is_retryable() {
                        tracing::warn!(job_id = job.id, error = %e, "Worker launch failed, job stays queued");
                    } else {
                        tracing::error!(job_id = job.id, error = %e, "Worker launch rejected, job stays queued");
                    }
                    continue;
                }
            };

            // Registered before the claim so a failed claim still leaves the
            // worker tracked and counted against the ceiling.
            if let Err(e) = self
                .registry
                .add(Worker::launched(worker_id.clone(), job.id))
            {
                report.anomalies += 1;
                tracing::warn!(job_id = job.id, error = %e, "Provider reused a tracked worker id, job stays queued");
                continue;
            }
            available -= 1;
            report.launched += 1;

            match bounded_store(limit, self.store.mark_assigned(job.id, &worker_id)).await {
                Ok(()) => {
                    report.claimed += 1;
                    tracing::info!(job_id = job.id, worker_id = %worker_id, "Job assigned");
                }
                Err(e) if e.is_claim_race() => {
                    report.claim_failures += 1;
                    tracing::warn!(
                        job_id = job.id,
                        worker_id = %worker_id,
                        error = %e,
                        "Job claimed elsewhere, worker left for reclamation"
                    );
                }
                Err(e) => {
                    report.claim_failures += 1;
                    tracing::warn!(
                        job_id = job.id,
                        worker_id = %worker_id,
                        error = %e,
                        "Could not record assignment, worker left for reclamation"
                    );
                }
            }
        }
        Ok(())
    }

    /// Issue a stop for every active worker.
    pub async fn drain(&mut self) -> usize {
        let limit = self.config.call_timeout;
        let live: Vec<WorkerId> = self
            .registry
            .workers()
            .filter(|w| w.is_active())
            .map(|w| w.id.clone())
            .collect();

        let mut stopped = 0;
        for id in live {
            match bounded_provider(limit, self.provider.stop(&id)).await {
                Ok(()) => {
                    stopped += 1;
                    if let Err(e) = self.registry.mark_stop_requested(&id, Utc::now()) {
                        tracing::warn!(error = %e, "Registry anomaly while recording stop");
                    }
                }
                Err(e) => {
                    tracing::warn!(worker_id = %id, error = %e, "Failed to stop worker while draining");
                }
            }
        }
        tracing::info!(stopped, "Drained workers");
        stopped
    }

    /// Tick until `shutdown` is cancelled.
    ///
    /// Cancellation is honored between ticks and during the wait; a tick in
    /// progress runs to completion. Workers are left running unless the
    /// shutdown policy is [`ShutdownPolicy::Drain`].
    pub async fn run(&mut self, shutdown: CancellationToken) {
        tracing::info!(
            scheduler_id = %self.config.scheduler_id,
            ceiling = self.config.concurrency_ceiling,
            poll_interval = ?self.config.poll_interval,
            "Scheduler starting"
        );

        if self.config.recover_on_start && !self.recovered {
            loop {
                match self.recover().await {
                    Ok(adopted) => {
                        tracing::info!(adopted, "Registry rebuilt from provider");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Registry rebuild failed, retrying after poll interval");
                        self.publish(None, Some(e.to_string()));
                    }
                }
                if !self.wait(&shutdown).await {
                    tracing::info!("Shutdown requested before registry rebuild completed");
                    return;
                }
            }
        }

        while !shutdown.is_cancelled() {
            match self.tick().await {
                Ok(report) => tracing::info!(
                    tick = self.ticks,
                    queued = report.queued,
                    launched = report.launched,
                    claimed = report.claimed,
                    orphaned = report.orphaned,
                    adopted = report.adopted,
                    stop_requested = report.stop_requested,
                    removed = report.removed,
                    active = report.active,
                    "Tick complete"
                ),
                Err(e) => {
                    tracing::warn!(tick = self.ticks, error = %e, "Tick aborted, retrying after poll interval")
                }
            }
            if !self.wait(&shutdown).await {
                break;
            }
        }

        if self.config.shutdown == ShutdownPolicy::Drain {
            self.drain().await;
        }
        tracing::info!(active = self.registry.count_active(), "Scheduler stopped");
    }

    /// Sleep for the poll interval. Returns false if cancelled first.
    async fn wait(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.poll_interval) => true,
        }
    }

    fn publish(&self, report: Option<TickReport>, error: Option<String>) {
        let workers = self.registry.snapshot();
        let active = self.registry.count_active();
        self.snapshot_tx.send_modify(|snap| {
            snap.active = active;
            snap.ticks = self.ticks;
            snap.recovered = self.recovered;
            snap.workers = workers;
            if report.is_some() {
                snap.last_tick = report;
            }
            snap.last_error = error;
            snap.updated_at = Utc::now();
        });
    }
}
