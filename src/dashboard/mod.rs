use std::net::SocketAddr;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::scheduler::{SchedulerSnapshot, TickReport};
use crate::worker::Worker;

/// Read-only view over the scheduler's published snapshots.
#[derive(Clone)]
pub struct DashboardState {
    pub snapshots: watch::Receiver<SchedulerSnapshot>,
}

#[derive(Serialize)]
struct StatusResponse {
    scheduler_id: String,
    ceiling: usize,
    active: usize,
    available: usize,
    ticks: u64,
    recovered: bool,
    last_tick: Option<TickReport>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/workers", get(workers_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let snap = state.snapshots.borrow().clone();
    Json(StatusResponse {
        available: snap.ceiling.saturating_sub(snap.active),
        scheduler_id: snap.scheduler_id,
        ceiling: snap.ceiling,
        active: snap.active,
        ticks: snap.ticks,
        recovered: snap.recovered,
        last_tick: snap.last_tick,
        last_error: snap.last_error,
        updated_at: snap.updated_at,
    })
}

async fn workers_handler(State(state): State<DashboardState>) -> Json<Vec<Worker>> {
    let workers = state.snapshots.borrow().workers.clone();
    Json(workers)
}
