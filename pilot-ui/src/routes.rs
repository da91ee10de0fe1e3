//! HTTP route handlers for the dashboard API.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use pilot::core::types::TaskSource;
use pilot::events::{Event, EventStats};
use pilot::fix_registry::{ErrorRecord, RegistryStats};
use pilot::intake::Submission;
use pilot::tools::ToolSpec;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state::AppState;

const TOP_ERRORS: usize = 20;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", post(submit_task))
        .route("/stop", post(stop))
        .route("/events/history", get(event_history))
        .route("/stats", get(stats))
        .route("/fixes", get(list_fixes).post(record_fix))
        .route("/tools", get(list_tools))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct TaskRequest {
    text: String,
}

/// POST /api/tasks - enqueue a task, or stop the active one on a kill word.
async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> (StatusCode, Json<Submission>) {
    let submission = state.queue.submit(&request.text, TaskSource::Dashboard);
    let status = match &submission {
        Submission::Queued { .. } | Submission::StopRequested => StatusCode::ACCEPTED,
        Submission::Rejected { .. } if request.text.trim().is_empty() => StatusCode::BAD_REQUEST,
        Submission::Rejected { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(submission))
}

/// POST /api/stop - stop the active task.
async fn stop(State(state): State<AppState>) -> (StatusCode, Json<Submission>) {
    info!("stop requested from dashboard");
    state.queue.request_stop(TaskSource::Dashboard);
    (StatusCode::ACCEPTED, Json(Submission::StopRequested))
}

/// GET /api/events/history - recent events, oldest first.
async fn event_history(State(state): State<AppState>) -> Json<Vec<Event>> {
    Json(state.events.history())
}

#[derive(Serialize)]
struct StatsResponse {
    events: EventStats,
    fixes: RegistryStats,
}

/// GET /api/stats - event counters and fix registry summary.
async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        events: state.events.stats(),
        fixes: state.fixes.stats(),
    })
}

#[derive(Serialize)]
struct FixesResponse {
    stats: RegistryStats,
    top: Vec<ErrorRecord>,
}

/// GET /api/fixes - most frequent errors with their known fixes.
async fn list_fixes(State(state): State<AppState>) -> Json<FixesResponse> {
    Json(FixesResponse {
        stats: state.fixes.stats(),
        top: state.fixes.top_errors(TOP_ERRORS),
    })
}

#[derive(Deserialize)]
struct FixRequest {
    error: String,
    context: String,
    fix: String,
}

/// POST /api/fixes - attach an operator-supplied fix to an error.
async fn record_fix(
    State(state): State<AppState>,
    Json(request): Json<FixRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let blank = [&request.error, &request.context, &request.fix]
        .iter()
        .any(|field| field.trim().is_empty());
    if blank {
        return Err((
            StatusCode::BAD_REQUEST,
            "error, context and fix must be non-empty".to_string(),
        ));
    }
    state
        .fixes
        .record_fix(&request.error, &request.context, &request.fix, "manual");
    Ok(StatusCode::CREATED)
}

/// GET /api/tools - tools the planner advertises.
async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolSpec>> {
    Json(state.tools.as_ref().clone())
}
