use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::scheduler::Scheduler;

/// Advisory operator surface: liveness, pipeline status and cooperative
/// job cancellation. Nothing here participates in scheduling decisions.
pub fn app_router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/jobs/:id/cancel", post(cancel_job))
        .with_state(scheduler)
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(scheduler): State<Arc<Scheduler>>) -> impl IntoResponse {
    Json(scheduler.status())
}

async fn cancel_job(State(scheduler): State<Arc<Scheduler>>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match scheduler.cancel_job(id) {
        Ok(()) => (StatusCode::ACCEPTED, "cancellation requested").into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}
