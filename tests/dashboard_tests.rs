
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use jobfleet::dashboard::{router, DashboardState};
use test_harness::Harness;

fn create_test_app(h: &Harness) -> Router {
    router(DashboardState {
        snapshots: h.scheduler.subscribe(),
    })
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_status_before_first_tick() {
    let h = Harness::new(3);
    let (status, json) = get_json(create_test_app(&h), "/api/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["scheduler_id"], "test-fleet");
    assert_eq!(json["ceiling"], 3);
    assert_eq!(json["active"], 0);
    assert_eq!(json["available"], 3);
    assert_eq!(json["ticks"], 0);
    assert_eq!(json["recovered"], false);
    assert!(json["last_tick"].is_null());
    assert!(json["last_error"].is_null());
}

#[tokio::test]
async fn test_status_reflects_latest_tick() {
    let mut h = Harness::new(2);
    h.submit_jobs(3).await;
    let app = create_test_app(&h);

    h.scheduler.tick().await.unwrap();
    let (status, json) = get_json(app, "/api/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["active"], 2);
    assert_eq!(json["available"], 0);
    assert_eq!(json["ticks"], 1);
    assert_eq!(json["last_tick"]["queued"], 3);
    assert_eq!(json["last_tick"]["launched"], 2);
    assert_eq!(json["last_tick"]["claimed"], 2);
}

#[tokio::test]
async fn test_status_reports_store_outage() {
    let mut h = Harness::new(1);
    h.store.set_down(true).await;
    let _ = h.scheduler.tick().await;

    let (_, json) = get_json(create_test_app(&h), "/api/status").await;
    let error = json["last_error"].as_str().unwrap();
    assert!(error.contains("job store unreachable"), "got: {error}");
}

#[tokio::test]
async fn test_workers_empty() {
    let h = Harness::new(1);
    let (status, json) = get_json(create_test_app(&h), "/api/workers").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_workers_lists_tracked_workers() {
    let mut h = Harness::new(2);
    let jobs = h.submit_jobs(2).await;
    h.scheduler.tick().await.unwrap();

    let (status, json) = get_json(create_test_app(&h), "/api/workers").await;
    assert_eq!(status, StatusCode::OK);

    let workers = json.as_array().unwrap();
    assert_eq!(workers.len(), 2);
    for worker in workers {
        assert_eq!(worker["status"], "PENDING");
        assert!(worker["stop_requested_at"].is_null());
        let job_id = worker["job_id"].as_u64().unwrap();
        assert!(jobs.iter().any(|j| j.id == job_id));
        assert_eq!(
            worker["id"].as_str().unwrap(),
            h.worker_of(job_id).await.as_str()
        );
    }
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let h = Harness::new(1);
    let response = create_test_app(&h)
        .oneshot(Request::builder().uri("/api/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
