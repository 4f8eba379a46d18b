//! The admin HTTP surface: `/start`, `/pause`, `/consume` (resume), and
//! `/abort` for the single live job.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tiler_core::controller::ControlEvent;

use crate::state::{AppState, ControlError, StartError};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/start", get(start))
        .route("/pause", get(pause))
        .route("/consume", get(consume))
        .route("/abort", get(abort))
        .with_state(state)
}

async fn start(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let job_id = params.get("id").cloned();
    match state.start_job(job_id).await {
        Ok(id) => {
            tracing::info!(job_id = %id, "job started");
            ok_response()
        }
        Err(err @ StartError::AlreadyRunning) => {
            tracing::warn!(%err, "rejected /start");
            error_response(StatusCode::CONFLICT, &err)
        }
        Err(err) => {
            tracing::error!(%err, "rejected /start");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err)
        }
    }
}

async fn pause(State(state): State<Arc<AppState>>) -> Response {
    control(state, ControlEvent::Pause).await
}

async fn consume(State(state): State<Arc<AppState>>) -> Response {
    control(state, ControlEvent::Resume).await
}

async fn abort(State(state): State<Arc<AppState>>) -> Response {
    control(state, ControlEvent::Abort).await
}

async fn control(state: Arc<AppState>, event: ControlEvent) -> Response {
    match state.send_control(event).await {
        Ok(()) => ok_response(),
        Err(err @ ControlError::NoActiveJob) => {
            tracing::warn!(%err, "rejected control event");
            error_response(StatusCode::CONFLICT, &err)
        }
        Err(err) => {
            tracing::warn!(%err, "rejected control event");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err)
        }
    }
}

fn ok_response() -> Response {
    (StatusCode::OK, Json(json!({"message": "ok"}))).into_response()
}

fn error_response(status: StatusCode, err: &dyn std::fmt::Display) -> Response {
    (status, Json(json!({"message": err.to_string()}))).into_response()
}
