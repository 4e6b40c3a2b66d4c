// Scheduled-job inspection and pause/resume routes (§6, C6 passthrough).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use taskloop_contracts::dto::{ScheduledJobListResponse, ScheduledJobResponse};
use taskloop_contracts::{ScheduledJob, TriggerSpec};

use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/tasks/scheduled", get(list_scheduled))
        .route("/tasks/scheduled/{job_id}", get(get_scheduled))
        .route("/tasks/scheduled/{job_id}/pause", post(pause_scheduled))
        .route("/tasks/scheduled/{job_id}/resume", post(resume_scheduled))
        .with_state(state)
}

fn trigger_type(spec: &TriggerSpec) -> &'static str {
    match spec {
        TriggerSpec::Cron { .. } => "cron",
        TriggerSpec::Interval { .. } => "interval",
        TriggerSpec::Date { .. } => "date",
    }
}

fn trigger_description(spec: &TriggerSpec) -> String {
    match spec {
        TriggerSpec::Cron { expr } => expr.clone(),
        TriggerSpec::Interval { period_seconds } => format!("every {period_seconds}s"),
        TriggerSpec::Date { at } => format!("once at {at}"),
    }
}

fn to_response(job: ScheduledJob) -> ScheduledJobResponse {
    ScheduledJobResponse {
        job_id: job.job_id,
        job_name: job.job_name,
        next_run_time: job.next_run_time,
        trigger_type: trigger_type(&job.trigger_spec).to_string(),
        trigger_description: trigger_description(&job.trigger_spec),
        is_paused: job.paused,
        misfire_grace_time: Some(job.misfire_grace_seconds),
        max_instances: Some(job.max_instances),
    }
}

/// GET /tasks/scheduled
#[utoipa::path(
    get,
    path = "/tasks/scheduled",
    responses((status = 200, description = "All registered scheduled jobs", body = ScheduledJobListResponse)),
    tag = "scheduled"
)]
pub async fn list_scheduled(State(state): State<AppState>) -> Json<ScheduledJobListResponse> {
    let jobs: Vec<ScheduledJobResponse> = state.service.get_scheduled_jobs().await.into_iter().map(to_response).collect();
    Json(ScheduledJobListResponse { count: jobs.len(), jobs })
}

/// GET /tasks/scheduled/{job_id}
#[utoipa::path(
    get,
    path = "/tasks/scheduled/{job_id}",
    params(("job_id" = String, Path, description = "Scheduled job id")),
    responses(
        (status = 200, description = "Scheduled job detail", body = ScheduledJobResponse),
        (status = 404, description = "No such job"),
    ),
    tag = "scheduled"
)]
pub async fn get_scheduled(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Json<ScheduledJobResponse>, StatusCode> {
    let job = state.service.get_scheduled_job(&job_id).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(to_response(job)))
}

/// POST /tasks/scheduled/{job_id}/pause
#[utoipa::path(
    post,
    path = "/tasks/scheduled/{job_id}/pause",
    params(("job_id" = String, Path, description = "Scheduled job id")),
    responses(
        (status = 200, description = "Job paused"),
        (status = 404, description = "No such job"),
    ),
    tag = "scheduled"
)]
pub async fn pause_scheduled(State(state): State<AppState>, Path(job_id): Path<String>) -> StatusCode {
    if state.service.pause_job(&job_id).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

/// POST /tasks/scheduled/{job_id}/resume
#[utoipa::path(
    post,
    path = "/tasks/scheduled/{job_id}/resume",
    params(("job_id" = String, Path, description = "Scheduled job id")),
    responses(
        (status = 200, description = "Job resumed"),
        (status = 404, description = "No such job"),
    ),
    tag = "scheduled"
)]
pub async fn resume_scheduled(State(state): State<AppState>, Path(job_id): Path<String>) -> StatusCode {
    if state.service.resume_job(&job_id).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}
