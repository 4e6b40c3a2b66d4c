// Task query, cancellation, triggering, result, and progress routes (§6).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use taskloop_contracts::dto::{
    BulkCancelRequest, BulkCancelResponse, CancelTaskRequest, CancelTaskResponse, StatsQuery, TaskExecutionDetailResponse,
    TaskExecutionResponse, TaskProgressResponse, TaskSearchParams, TaskSearchResponse, TaskStatsResponse,
    TriggerTaskRequest, TriggerTaskResponse,
};
use taskloop_contracts::{HistoryFilters, ResultEntry};
use uuid::Uuid;

use crate::error::{ApiError, ValidationFailure};
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/running", get(running_tasks))
        .route("/tasks/stats", get(stats))
        .route("/tasks/trigger", post(trigger_task))
        .route("/tasks/cancel", post(cancel_task))
        .route("/tasks/bulk-cancel", post(bulk_cancel))
        .route("/tasks/{task_id}", get(get_task))
        .route("/tasks/{task_id}/result", get(get_result))
        .route("/tasks/{task_id}/progress", get(get_progress))
        .with_state(state)
}

fn filters_from_params(params: &TaskSearchParams) -> HistoryFilters {
    HistoryFilters {
        task_name: params.task_name.clone(),
        task_name_like: params.task_name_like.clone(),
        status: params.status,
        statuses: params.statuses.clone(),
        worker_id: params.worker_id.clone(),
        error_type: params.error_type.clone(),
        created_after: params.created_after,
        created_before: params.created_before,
        min_duration_ms: params.min_duration_ms,
        max_duration_ms: params.max_duration_ms,
    }
}

/// GET /tasks
#[utoipa::path(
    get,
    path = "/tasks",
    params(TaskSearchParams),
    responses(
        (status = 200, description = "Paged task execution history", body = TaskSearchResponse),
        (status = 422, description = "Invalid query parameters"),
    ),
    tag = "tasks"
)]
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskSearchParams>,
) -> Result<Json<TaskSearchResponse>, ValidationFailure> {
    params.validate().map_err(ValidationFailure)?;

    let filters = filters_from_params(&params);
    let (items, total) = state.service.search_tasks(&filters, params.limit, params.offset).await;

    Ok(Json(TaskSearchResponse {
        items: items.iter().map(TaskExecutionResponse::from).collect(),
        total,
        limit: params.limit,
        offset: params.offset,
    }))
}

/// GET /tasks/running
#[utoipa::path(
    get,
    path = "/tasks/running",
    responses((status = 200, description = "Currently running executions", body = Vec<taskloop_contracts::dto::RunningTaskResponse>)),
    tag = "tasks"
)]
pub async fn running_tasks(State(state): State<AppState>) -> Json<Vec<taskloop_contracts::dto::RunningTaskResponse>> {
    let running = state.service.get_running_tasks().await;
    Json(
        running
            .into_iter()
            .map(|(r, running_for_ms)| taskloop_contracts::dto::RunningTaskResponse {
                task_id: r.task_id,
                task_name: r.task_name,
                started_at: r.started_at.unwrap_or(r.created_at),
                running_for_ms,
                worker_id: r.worker_id,
            })
            .collect(),
    )
}

/// GET /tasks/stats
#[utoipa::path(
    get,
    path = "/tasks/stats",
    params(StatsQuery),
    responses(
        (status = 200, description = "Aggregate execution stats", body = TaskStatsResponse),
        (status = 422, description = "hours out of range"),
    ),
    tag = "tasks"
)]
pub async fn stats(State(state): State<AppState>, Query(query): Query<StatsQuery>) -> Result<Json<TaskStatsResponse>, ValidationFailure> {
    query.validate().map_err(|msg| ValidationFailure(vec![("hours".to_string(), msg)]))?;

    let s = state.service.get_stats(query.hours).await;
    let mut by_status = std::collections::HashMap::new();
    by_status.insert("success".to_string(), s.success_count);
    by_status.insert("failure".to_string(), s.failure_count);
    by_status.insert("running".to_string(), s.running_count);
    by_status.insert("cancelled".to_string(), s.cancelled_count);
    by_status.insert("pending".to_string(), s.pending_count);

    Ok(Json(TaskStatsResponse {
        total_count: s.total_count,
        success_count: s.success_count,
        failure_count: s.failure_count,
        running_count: s.running_count,
        cancelled_count: s.cancelled_count,
        avg_duration_ms: s.avg_duration_ms,
        by_task_name: s.by_task_name,
        by_status,
    }))
}

/// GET /tasks/{task_id}
#[utoipa::path(
    get,
    path = "/tasks/{task_id}",
    params(("task_id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Execution detail", body = TaskExecutionDetailResponse),
        (status = 404, description = "No execution record for this task_id"),
    ),
    tag = "tasks"
)]
pub async fn get_task(State(state): State<AppState>, Path(task_id): Path<Uuid>) -> Result<Json<TaskExecutionDetailResponse>, StatusCode> {
    let record = state.service.get_task_details(task_id).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json((&record).into()))
}

/// POST /tasks/cancel
#[utoipa::path(
    post,
    path = "/tasks/cancel",
    request_body = CancelTaskRequest,
    responses((status = 200, description = "Cancellation outcome (not an error even when not cancelled)", body = CancelTaskResponse)),
    tag = "tasks"
)]
pub async fn cancel_task(State(state): State<AppState>, Json(req): Json<CancelTaskRequest>) -> Json<CancelTaskResponse> {
    let outcome = state.service.cancel_task(req.task_id, req.reason).await;
    Json(CancelTaskResponse {
        task_id: req.task_id,
        cancelled: outcome.cancelled,
        message: outcome.message,
        previous_status: outcome.previous_status,
    })
}

/// POST /tasks/trigger
#[utoipa::path(
    post,
    path = "/tasks/trigger",
    request_body = TriggerTaskRequest,
    responses(
        (status = 200, description = "Task queued", body = TriggerTaskResponse),
        (status = 422, description = "Unknown task name"),
        (status = 503, description = "Broker unavailable"),
    ),
    tag = "tasks"
)]
pub async fn trigger_task(State(state): State<AppState>, Json(req): Json<TriggerTaskRequest>) -> Result<Json<TriggerTaskResponse>, ApiError> {
    let outcome = state.service.trigger_task(req.task.as_str(), req.params).await?;
    Ok(Json(TriggerTaskResponse {
        task_id: outcome.task_id,
        task_name: outcome.task_name,
        status: "queued".to_string(),
        message: "task queued for execution".to_string(),
    }))
}

/// POST /tasks/bulk-cancel
#[utoipa::path(
    post,
    path = "/tasks/bulk-cancel",
    request_body = BulkCancelRequest,
    responses(
        (status = 200, description = "Per-task cancellation results", body = BulkCancelResponse),
        (status = 422, description = "task_ids is empty"),
    ),
    tag = "tasks"
)]
pub async fn bulk_cancel(State(state): State<AppState>, Json(req): Json<BulkCancelRequest>) -> Result<Json<BulkCancelResponse>, ValidationFailure> {
    req.validate().map_err(ValidationFailure)?;
    let results = state.service.bulk_cancel(&req.task_ids, req.reason).await;
    let successful = results.iter().filter(|r| r.success).count();
    Ok(Json(BulkCancelResponse {
        total_requested: req.task_ids.len(),
        successful,
        failed: results.len() - successful,
        results,
    }))
}

/// GET /tasks/{task_id}/result
#[utoipa::path(
    get,
    path = "/tasks/{task_id}/result",
    params(("task_id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Stored result, tagged ok/err", body = ResultEntry),
        (status = 404, description = "No result recorded or already consumed"),
    ),
    tag = "tasks"
)]
pub async fn get_result(State(state): State<AppState>, Path(task_id): Path<Uuid>) -> Result<Json<ResultEntry>, ApiError> {
    let entry = state.service.get_result(task_id, true).await?;
    Ok(Json(entry))
}

/// GET /tasks/{task_id}/progress
#[utoipa::path(
    get,
    path = "/tasks/{task_id}/progress",
    params(("task_id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Latest progress payload", body = TaskProgressResponse),
        (status = 404, description = "No progress recorded"),
    ),
    tag = "tasks"
)]
pub async fn get_progress(State(state): State<AppState>, Path(task_id): Path<Uuid>) -> Result<Json<TaskProgressResponse>, ApiError> {
    let entry = state.service.get_progress(task_id).await?;
    let entry = entry.ok_or(ApiError(taskloop_contracts::TaskError::ResultMissing(task_id)))?;

    Ok(Json(TaskProgressResponse {
        task_id,
        percent: entry.payload.get("percent").and_then(|v| v.as_f64()),
        message: entry.payload.get("message").and_then(|v| v.as_str()).map(str::to_string),
        current: entry.payload.get("current").and_then(|v| v.as_i64()),
        total: entry.payload.get("total").and_then(|v| v.as_i64()),
        updated_at: Some(entry.updated_at),
        extra: entry.payload.as_object().map(|o| o.clone().into_iter().collect()),
    }))
}
