// Request/response shapes for the HTTP control plane (C9). Kept in
// `taskloop-contracts` rather than `taskloop-api` so `taskloop-service`
// can build these directly without a dependency on axum.

use crate::record::{ExecutionRecord, TaskStatus};
use crate::task_name::TaskName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

fn default_limit() -> i64 {
    50
}

fn default_order_by() -> String {
    "created_at".to_string()
}

fn default_order_dir() -> String {
    "desc".to_string()
}

/// Query parameters for `GET /tasks`.
#[derive(Debug, Clone, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TaskSearchParams {
    pub task_name: Option<String>,
    pub task_name_like: Option<String>,
    pub status: Option<TaskStatus>,
    pub statuses: Option<Vec<TaskStatus>>,
    pub worker_id: Option<String>,
    pub error_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    #[serde(default = "default_order_by")]
    pub order_by: String,
    #[serde(default = "default_order_dir")]
    pub order_dir: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl TaskSearchParams {
    /// Field-level validation per §6. Returns the offending field name and
    /// message so the HTTP layer can build a 422 with field paths.
    pub fn validate(&self) -> Result<(), Vec<(String, String)>> {
        let mut errors = Vec::new();
        if !(1..=200).contains(&self.limit) {
            errors.push(("limit".to_string(), "must be between 1 and 200".to_string()));
        }
        if self.offset < 0 {
            errors.push(("offset".to_string(), "must be >= 0".to_string()));
        }
        if let Some(v) = self.min_duration_ms {
            if v < 0 {
                errors.push(("min_duration_ms".to_string(), "must be >= 0".to_string()));
            }
        }
        if let Some(v) = self.max_duration_ms {
            if v < 0 {
                errors.push(("max_duration_ms".to_string(), "must be >= 0".to_string()));
            }
        }
        if !matches!(self.order_by.as_str(), "created_at" | "duration_ms" | "task_name" | "status") {
            errors.push(("order_by".to_string(), "must be one of created_at, duration_ms, task_name, status".to_string()));
        }
        if !matches!(self.order_dir.as_str(), "asc" | "desc") {
            errors.push(("order_dir".to_string(), "must be asc or desc".to_string()));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskExecutionResponse {
    pub task_id: Uuid,
    pub task_name: String,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl From<&ExecutionRecord> for TaskExecutionResponse {
    fn from(r: &ExecutionRecord) -> Self {
        Self {
            task_id: r.task_id,
            task_name: r.task_name.clone(),
            status: r.status,
            worker_id: r.worker_id.clone(),
            started_at: r.started_at,
            finished_at: r.finished_at,
            duration_ms: r.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskExecutionDetailResponse {
    #[serde(flatten)]
    pub base: TaskExecutionResponse,
    pub return_value: Option<Value>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub task_args: Option<Vec<Value>>,
    pub task_kwargs: Option<HashMap<String, Value>>,
    pub labels: Option<HashMap<String, Value>>,
    pub retry_count: u32,
    pub queue_name: Option<String>,
    pub progress: Option<Value>,
}

impl From<&ExecutionRecord> for TaskExecutionDetailResponse {
    fn from(r: &ExecutionRecord) -> Self {
        Self {
            base: r.into(),
            return_value: r.return_value.clone(),
            error_type: r.error_type.clone(),
            error_message: r.error_message.clone(),
            error_traceback: r.error_traceback.clone(),
            task_args: r.task_args.clone(),
            task_kwargs: r.task_kwargs.clone(),
            labels: r.labels.clone(),
            retry_count: r.retry_count,
            queue_name: r.queue_name.clone(),
            progress: r.progress.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RunningTaskResponse {
    pub task_id: Uuid,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub running_for_ms: i64,
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskSearchResponse {
    pub items: Vec<TaskExecutionResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskStatsResponse {
    pub total_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub running_count: i64,
    pub cancelled_count: i64,
    pub avg_duration_ms: Option<f64>,
    pub by_task_name: HashMap<String, i64>,
    pub by_status: HashMap<String, i64>,
}

#[derive(Debug, Clone, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StatsQuery {
    #[serde(default = "default_stats_hours")]
    pub hours: i64,
}

fn default_stats_hours() -> i64 {
    24
}

impl StatsQuery {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=720).contains(&self.hours) {
            Err("hours must be between 1 and 720".to_string())
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScheduledJobResponse {
    pub job_id: String,
    pub job_name: String,
    pub next_run_time: Option<DateTime<Utc>>,
    pub trigger_type: String,
    pub trigger_description: String,
    pub is_paused: bool,
    pub misfire_grace_time: Option<i64>,
    pub max_instances: Option<u32>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScheduledJobListResponse {
    pub jobs: Vec<ScheduledJobResponse>,
    pub count: usize,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CancelTaskRequest {
    pub task_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CancelTaskResponse {
    pub task_id: Uuid,
    pub cancelled: bool,
    pub message: String,
    pub previous_status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TriggerTaskRequest {
    pub task: TaskName,
    pub params: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TriggerTaskResponse {
    pub task_id: Uuid,
    pub task_name: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatusDto {
    Pending,
    Retried,
    Discarded,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DlqEntryResponse {
    pub task_id: Uuid,
    pub task_name: String,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<HashMap<String, Value>>,
    pub labels: Option<HashMap<String, Value>>,
    pub error_message: String,
    pub error_type: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub status: crate::dlq::DlqStatus,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DlqListResponse {
    pub items: Vec<DlqEntryResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DlqListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    pub status: Option<crate::dlq::DlqStatus>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DlqRetryRequest {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DlqRetryResponse {
    pub original_task_id: Uuid,
    pub new_task_id: Uuid,
    pub task_name: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DlqDiscardRequest {
    pub task_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DlqDiscardResponse {
    pub task_id: Uuid,
    pub discarded: bool,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BulkCancelRequest {
    pub task_ids: Vec<Uuid>,
    pub reason: Option<String>,
}

impl BulkCancelRequest {
    pub fn validate(&self) -> Result<(), Vec<(String, String)>> {
        if self.task_ids.is_empty() {
            Err(vec![("task_ids".to_string(), "must not be empty".to_string())])
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BulkOperationResult {
    pub task_id: Uuid,
    pub success: bool,
    pub message: String,
    pub previous_status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BulkCancelResponse {
    pub total_requested: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BulkOperationResult>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BulkRetryRequest {
    pub task_ids: Vec<Uuid>,
}

impl BulkRetryRequest {
    pub fn validate(&self) -> Result<(), Vec<(String, String)>> {
        if self.task_ids.is_empty() {
            Err(vec![("task_ids".to_string(), "must not be empty".to_string())])
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BulkRetryResponse {
    pub total_requested: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BulkOperationResult>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskProgressResponse {
    pub task_id: Uuid,
    pub percent: Option<f64>,
    pub message: Option<String>,
    pub current: Option<i64>,
    pub total: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub extra: Option<HashMap<String, Value>>,
}

/// Field-level validation error detail, used for every 422 response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ValidationErrorDetail {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ValidationErrorResponse {
    pub detail: Vec<ValidationErrorDetail>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_params() -> TaskSearchParams {
        TaskSearchParams {
            task_name: None,
            task_name_like: None,
            status: None,
            statuses: None,
            worker_id: None,
            error_type: None,
            created_after: None,
            created_before: None,
            min_duration_ms: None,
            max_duration_ms: None,
            order_by: default_order_by(),
            order_dir: default_order_dir(),
            limit: default_limit(),
            offset: 0,
        }
    }

    #[test]
    fn default_task_search_params_are_valid() {
        assert!(valid_params().validate().is_ok());
    }

    #[test]
    fn limit_out_of_range_is_rejected() {
        let mut params = valid_params();
        params.limit = 0;
        let errors = params.validate().unwrap_err();
        assert!(errors.iter().any(|(field, _)| field == "limit"));

        let mut params = valid_params();
        params.limit = 500;
        assert!(params.validate().is_err());
    }

    #[test]
    fn unknown_order_by_is_rejected() {
        let mut params = valid_params();
        params.order_by = "nonsense".to_string();
        let errors = params.validate().unwrap_err();
        assert!(errors.iter().any(|(field, _)| field == "order_by"));
    }

    #[test]
    fn negative_durations_are_rejected() {
        let mut params = valid_params();
        params.min_duration_ms = Some(-1);
        assert!(params.validate().is_err());
    }

    #[test]
    fn stats_query_hours_bounds() {
        assert!(StatsQuery { hours: 24 }.validate().is_ok());
        assert!(StatsQuery { hours: 0 }.validate().is_err());
        assert!(StatsQuery { hours: 721 }.validate().is_err());
    }

    #[test]
    fn bulk_cancel_rejects_empty_task_ids() {
        let req = BulkCancelRequest { task_ids: Vec::new(), reason: None };
        let errors = req.validate().unwrap_err();
        assert!(errors.iter().any(|(field, _)| field == "task_ids"));

        let req = BulkCancelRequest { task_ids: vec![Uuid::nil()], reason: None };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn bulk_retry_rejects_empty_task_ids() {
        let req = BulkRetryRequest { task_ids: Vec::new() };
        assert!(req.validate().is_err());

        let req = BulkRetryRequest { task_ids: vec![Uuid::nil()] };
        assert!(req.validate().is_ok());
    }
}
