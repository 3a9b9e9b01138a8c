//! `/api/tools` routes.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, State},
    middleware::from_fn_with_state,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use futures::Stream;
use serde::Serialize;
use serde_json::json;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use uuid::Uuid;

use super::controller::StreamEvent;
use super::error::ToolExecutionError;
use super::executor::JobInfo;
use crate::AppState;
use crate::security::claims::CallerIdentity;
use crate::security::middleware::auth_middleware;
use crate::security::rate_limit::rate_limit_middleware;

/// Tool routes, or an empty router when development mode is off so every
/// path falls through to the default 404.
pub fn router(state: &AppState) -> Router<AppState> {
    if !state.config.gateway.dev_mode {
        return Router::new();
    }

    Router::new()
        .route("/api/tools", get(list_tools))
        .route("/api/tools/jobs", get(list_jobs))
        .route("/api/tools/jobs/{job_id}", delete(cancel_job))
        .route("/api/tools/metrics", get(metrics))
        .route("/api/tools/{name}/schema", get(tool_schema))
        .route("/api/tools/{name}/execute", post(execute_tool))
        .route_layer(from_fn_with_state(state.clone(), auth_middleware))
        .route_layer(from_fn_with_state(state.clone(), rate_limit_middleware))
}

/// GET /api/tools
async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.list_tools())
}

/// GET /api/tools/{name}/schema
async fn tool_schema(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.gateway.get_schema(&name) {
        Ok(schema) => Json(schema).into_response(),
        Err(err) => err.with_request_id(Uuid::new_v4().to_string()).into_response(),
    }
}

/// POST /api/tools/{name}/execute
async fn execute_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(identity): Extension<CallerIdentity>,
    body: Bytes,
) -> Response {
    let prepared = match state.gateway.prepare(&name, &body, &identity) {
        Ok(prepared) => prepared,
        Err(err) => return err.into_response(),
    };

    if prepared.is_streaming() {
        let rx = state.gateway.stream_prepared(prepared);
        return sse_response(ReceiverStream::new(rx)).into_response();
    }

    match state.gateway.execute_prepared(prepared).await {
        Ok(envelope) => Json(envelope).into_response(),
        Err(err) => err.into_response(),
    }
}

fn sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send>
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    let stream = stream.map(|event| {
        let (name, payload) = match event {
            StreamEvent::Chunk(chunk) => ("chunk", serde_json::to_string(&chunk)),
            StreamEvent::Result(envelope) => ("result", serde_json::to_string(&envelope)),
            StreamEvent::Error(envelope) => ("error", serde_json::to_string(&envelope)),
        };
        let data = payload.unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(name).data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobList {
    jobs: Vec<JobInfo>,
    count: usize,
}

/// GET /api/tools/jobs
async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = state.gateway.active_jobs();
    Json(JobList {
        count: jobs.len(),
        jobs,
    })
}

/// DELETE /api/tools/jobs/{job_id}
async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    if state.gateway.cancel_job(&job_id) {
        Json(json!({ "jobId": job_id, "cancelled": true })).into_response()
    } else {
        ToolExecutionError::new(
            super::error::ErrorCode::ToolNotFound,
            format!("No active job '{job_id}'"),
        )
        .with_details(json!({ "jobId": job_id }))
        .with_request_id(Uuid::new_v4().to_string())
        .into_response()
    }
}

/// GET /api/tools/metrics
async fn metrics(State(state): State<AppState>) -> Response {
    match state.gateway.metrics() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => Json(json!({ "enabled": false })).into_response(),
    }
}
