// Dead-letter queue inspection, retry, and discard routes (§6, C5 passthrough).

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use taskloop_contracts::dto::{
    BulkRetryRequest, BulkRetryResponse, DlqDiscardRequest, DlqDiscardResponse, DlqEntryResponse, DlqListQuery, DlqListResponse,
    DlqRetryRequest, DlqRetryResponse,
};
use taskloop_contracts::DlqEntry;
use uuid::Uuid;

use crate::error::{ApiError, ValidationFailure};
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/tasks/dlq", get(list_dlq))
        .route("/tasks/dlq/{task_id}", get(get_dlq_entry))
        .route("/tasks/dlq/retry", post(retry_dlq))
        .route("/tasks/dlq/discard", post(discard_dlq))
        .route("/tasks/dlq/bulk-retry", post(bulk_retry_dlq))
        .with_state(state)
}

fn to_response(e: DlqEntry) -> DlqEntryResponse {
    DlqEntryResponse {
        task_id: e.task_id,
        task_name: e.task_name,
        args: Some(e.args),
        kwargs: Some(e.kwargs),
        labels: Some(e.labels),
        error_message: e.error_message,
        error_type: e.error_type,
        retry_count: e.retry_count,
        failed_at: e.failed_at,
        status: e.status,
    }
}

/// GET /tasks/dlq
#[utoipa::path(
    get,
    path = "/tasks/dlq",
    params(DlqListQuery),
    responses((status = 200, description = "Paged dead-letter entries", body = DlqListResponse)),
    tag = "dlq"
)]
pub async fn list_dlq(State(state): State<AppState>, Query(query): Query<DlqListQuery>) -> Json<DlqListResponse> {
    let (items, total) = state.service.dlq_list(query.limit, query.offset, query.status).await;
    Json(DlqListResponse {
        items: items.into_iter().map(to_response).collect(),
        total,
        limit: query.limit,
        offset: query.offset,
    })
}

/// GET /tasks/dlq/{task_id}
#[utoipa::path(
    get,
    path = "/tasks/dlq/{task_id}",
    params(("task_id" = Uuid, Path, description = "Original task id")),
    responses(
        (status = 200, description = "Dead-letter entry detail", body = DlqEntryResponse),
        (status = 404, description = "No dead-letter entry for this task_id"),
    ),
    tag = "dlq"
)]
pub async fn get_dlq_entry(State(state): State<AppState>, Path(task_id): Path<Uuid>) -> Result<Json<DlqEntryResponse>, axum::http::StatusCode> {
    let entry = state.service.dlq_get(task_id).await.ok_or(axum::http::StatusCode::NOT_FOUND)?;
    Ok(Json(to_response(entry)))
}

/// POST /tasks/dlq/retry
#[utoipa::path(
    post,
    path = "/tasks/dlq/retry",
    request_body = DlqRetryRequest,
    responses(
        (status = 200, description = "Entry requeued under a fresh task_id", body = DlqRetryResponse),
        (status = 404, description = "No such dead-letter entry"),
    ),
    tag = "dlq"
)]
pub async fn retry_dlq(State(state): State<AppState>, Json(req): Json<DlqRetryRequest>) -> Result<Json<DlqRetryResponse>, ApiError> {
    let outcome = state.service.dlq_retry(req.task_id).await?;
    Ok(Json(DlqRetryResponse {
        original_task_id: outcome.original_task_id,
        new_task_id: outcome.new_task_id,
        task_name: outcome.task_name,
        status: "queued".to_string(),
        message: format!("requeued as {}", outcome.new_task_id),
    }))
}

/// POST /tasks/dlq/discard
#[utoipa::path(
    post,
    path = "/tasks/dlq/discard",
    request_body = DlqDiscardRequest,
    responses(
        (status = 200, description = "Entry marked discarded", body = DlqDiscardResponse),
        (status = 404, description = "No such dead-letter entry"),
    ),
    tag = "dlq"
)]
pub async fn discard_dlq(State(state): State<AppState>, Json(req): Json<DlqDiscardRequest>) -> Result<Json<DlqDiscardResponse>, ApiError> {
    state.service.dlq_discard(req.task_id, req.reason).await?;
    Ok(Json(DlqDiscardResponse {
        task_id: req.task_id,
        discarded: true,
        message: format!("task {} discarded", req.task_id),
    }))
}

/// POST /tasks/dlq/bulk-retry
#[utoipa::path(
    post,
    path = "/tasks/dlq/bulk-retry",
    request_body = BulkRetryRequest,
    responses(
        (status = 200, description = "Per-entry retry results", body = BulkRetryResponse),
        (status = 422, description = "task_ids is empty"),
    ),
    tag = "dlq"
)]
pub async fn bulk_retry_dlq(State(state): State<AppState>, Json(req): Json<BulkRetryRequest>) -> Result<Json<BulkRetryResponse>, ValidationFailure> {
    req.validate().map_err(ValidationFailure)?;
    let results = state.service.bulk_retry_dlq(&req.task_ids).await;
    let successful = results.iter().filter(|r| r.success).count();
    Ok(Json(BulkRetryResponse {
        total_requested: req.task_ids.len(),
        successful,
        failed: results.len() - successful,
        results,
    }))
}
