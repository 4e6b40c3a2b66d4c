use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use taskloop_contracts::ProgressEntry;
use taskloop_results::ResultBackend;
use taskloop_tracker::ExecutionTracker;
use uuid::Uuid;

/// Everything a handler invocation needs: its inputs, a progress sink, and
/// a way to cooperatively notice cancellation (§5 suspension points d/e).
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
    pub labels: HashMap<String, Value>,
    pub retry_count: u32,
    result_backend: Arc<dyn ResultBackend>,
    tracker: Arc<dyn ExecutionTracker>,
    progress_ttl: Option<i64>,
}

impl TaskContext {
    pub fn new(
        task_id: Uuid,
        task_name: String,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        labels: HashMap<String, Value>,
        retry_count: u32,
        result_backend: Arc<dyn ResultBackend>,
        tracker: Arc<dyn ExecutionTracker>,
        progress_ttl: Option<i64>,
    ) -> Self {
        Self { task_id, task_name, args, kwargs, labels, retry_count, result_backend, tracker, progress_ttl }
    }

    /// Writes an arbitrary JSON progress payload, overwriting the previous one.
    pub async fn report_progress(&self, payload: Value) {
        let entry = ProgressEntry::new(payload);
        if let Err(e) = self.result_backend.set_progress(self.task_id, entry, self.progress_ttl).await {
            tracing::warn!(task_id = %self.task_id, error = %e, "failed to write progress");
        }
    }

    /// Cooperative cancellation check. A handler that never calls this runs
    /// to completion even after `cancel_task` flips the tracker row (§5).
    pub async fn is_cancelled(&self) -> bool {
        self.tracker
            .get_task_details(self.task_id)
            .await
            .map(|r| r.status == taskloop_contracts::TaskStatus::Cancelled)
            .unwrap_or(false)
    }
}
