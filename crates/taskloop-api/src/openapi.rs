// OpenAPI specification generation, mirroring `control-plane::openapi`:
// one derive enumerating every handler and DTO, consumed by the Swagger UI
// mount in `lib.rs`.

use taskloop_contracts::dto::{
    BulkCancelRequest, BulkCancelResponse, BulkOperationResult, BulkRetryRequest, BulkRetryResponse, CancelTaskRequest, CancelTaskResponse,
    DlqDiscardRequest, DlqDiscardResponse, DlqEntryResponse, DlqListResponse, DlqRetryRequest, DlqRetryResponse, RunningTaskResponse,
    ScheduledJobListResponse, ScheduledJobResponse, TaskExecutionDetailResponse, TaskExecutionResponse, TaskProgressResponse,
    TaskSearchResponse, TaskStatsResponse, TriggerTaskRequest, TriggerTaskResponse, ValidationErrorDetail, ValidationErrorResponse,
};
use taskloop_contracts::{DlqStatus, ResultEntry, TaskStatus};
use utoipa::OpenApi;

use crate::health::HealthResponse;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::health::health,
        crate::tasks::list_tasks,
        crate::tasks::running_tasks,
        crate::tasks::stats,
        crate::tasks::get_task,
        crate::tasks::cancel_task,
        crate::tasks::trigger_task,
        crate::tasks::bulk_cancel,
        crate::tasks::get_result,
        crate::tasks::get_progress,
        crate::scheduled::list_scheduled,
        crate::scheduled::get_scheduled,
        crate::scheduled::pause_scheduled,
        crate::scheduled::resume_scheduled,
        crate::dlq::list_dlq,
        crate::dlq::get_dlq_entry,
        crate::dlq::retry_dlq,
        crate::dlq::discard_dlq,
        crate::dlq::bulk_retry_dlq,
    ),
    components(
        schemas(
            HealthResponse,
            TaskStatus, TaskExecutionResponse, TaskExecutionDetailResponse, RunningTaskResponse, TaskSearchResponse,
            TaskStatsResponse, CancelTaskRequest, CancelTaskResponse, TriggerTaskRequest, TriggerTaskResponse,
            BulkCancelRequest, BulkCancelResponse, BulkOperationResult, BulkRetryRequest, BulkRetryResponse,
            TaskProgressResponse, ResultEntry,
            ScheduledJobResponse, ScheduledJobListResponse,
            DlqStatus, DlqEntryResponse, DlqListResponse, DlqRetryRequest, DlqRetryResponse,
            DlqDiscardRequest, DlqDiscardResponse,
            ValidationErrorDetail, ValidationErrorResponse,
        )
    ),
    tags(
        (name = "health", description = "Liveness and backend connectivity"),
        (name = "tasks", description = "Task execution history, cancellation, and triggering"),
        (name = "scheduled", description = "Scheduled job inspection and pause/resume"),
        (name = "dlq", description = "Dead-letter queue inspection, retry, and discard"),
    ),
    info(
        title = "Taskloop API",
        version = "0.1.0",
        description = "Control plane for the background task execution and tracking subsystem",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    pub fn to_json() -> String {
        Self::openapi().to_pretty_json().expect("failed to serialize OpenAPI spec")
    }
}
