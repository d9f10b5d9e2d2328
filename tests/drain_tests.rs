
use std::time::Duration;

use jobfleet::config::ShutdownPolicy;
use jobfleet::worker::WorkerStatus;
use test_harness::{test_config, Harness};
use tokio_util::sync::CancellationToken;

/// Run the scheduler in the background, let it tick for `ticks_for`, then
/// cancel and wait for it to finish.
async fn run_then_cancel(mut h: Harness, ticks_for: Duration) -> Harness {
    let token = CancellationToken::new();
    let child = token.clone();
    let mut scheduler = h.scheduler;
    let handle = tokio::spawn(async move {
        scheduler.run(child).await;
        scheduler
    });

    tokio::time::sleep(ticks_for).await;
    token.cancel();

    h.scheduler = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("scheduler stops promptly after cancellation")
        .unwrap();
    h
}

#[tokio::test]
async fn test_cancel_interrupts_poll_wait() {
    let mut config = test_config(1);
    config.poll_interval = Duration::from_secs(3600);
    let h = Harness::with_config(config);
    h.submit_jobs(1).await;

    let h = run_then_cancel(h, Duration::from_millis(100)).await;
    assert_eq!(h.scheduler.ticks(), 1);
    assert_eq!(h.provider.launch_count().await, 1);
}

#[tokio::test]
async fn test_cancelled_before_start_never_ticks() {
    let h = Harness::new(2);
    h.submit_jobs(2).await;

    let token = CancellationToken::new();
    token.cancel();
    let mut scheduler = h.scheduler;
    scheduler.run(token).await;

    assert_eq!(scheduler.ticks(), 0);
    assert_eq!(h.provider.launch_count().await, 0);
}

#[tokio::test]
async fn test_leave_policy_keeps_workers_running() {
    let h = Harness::with_config(test_config(2).with_shutdown(ShutdownPolicy::Leave));
    h.submit_jobs(2).await;

    let h = run_then_cancel(h, Duration::from_millis(150)).await;

    let live = h.provider.live_workers().await;
    assert_eq!(live.len(), 2);
    for id in &live {
        assert_eq!(h.provider.stop_calls(id).await, 0);
    }
}

#[tokio::test]
async fn test_drain_policy_stops_every_worker() {
    let h = Harness::with_config(test_config(2).with_shutdown(ShutdownPolicy::Drain));
    let jobs = h.submit_jobs(3).await;

    let h = run_then_cancel(h, Duration::from_millis(150)).await;

    assert!(h.provider.live_workers().await.is_empty());
    for worker in h.scheduler.workers() {
        assert!(worker.stop_requested_at.is_some());
        assert_eq!(
            h.provider.status_of(&worker.id).await,
            Some(WorkerStatus::Stopped)
        );
    }
    // the third job never got a slot
    assert_eq!(
        h.job(jobs[2].id).await.status,
        jobfleet::scheduler::JobStatus::Queued
    );
}

#[tokio::test]
async fn test_drain_skips_already_stopped_workers() {
    let mut h = Harness::new(2);
    h.submit_jobs(2).await;
    h.scheduler.tick().await.unwrap();

    let first = h.scheduler.workers()[0].id.clone();
    h.provider.set_status(&first, WorkerStatus::Stopped).await;
    // registry learns about the exit; the worker is removed on this tick
    h.scheduler.tick().await.unwrap();

    let stopped = h.scheduler.drain().await;
    assert_eq!(stopped, 1);
    assert_eq!(h.provider.stop_calls(&first).await, 0);
}

#[tokio::test]
async fn test_run_loop_survives_store_outage() {
    let h = Harness::new(1);
    h.submit_jobs(1).await;
    h.store.set_down(true).await;

    let token = CancellationToken::new();
    let child = token.clone();
    let mut scheduler = h.scheduler;
    let handle = tokio::spawn(async move {
        scheduler.run(child).await;
        scheduler
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.provider.launch_count().await, 0);

    h.store.set_down(false).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    token.cancel();

    let scheduler = handle.await.unwrap();
    assert!(scheduler.ticks() >= 2);
    assert_eq!(h.provider.launch_count().await, 1);
}
