// Task-management service (C8): aggregates the broker, result backend,
// tracker, dead-letter queue, and scheduler behind the small operational
// API the HTTP control plane (C9) is a thin layer over. Every method here
// catches backend errors and returns a structured result rather than
// letting a tracker/broker exception reach the caller (§4.7, §7).

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use taskloop_broker::Broker;
use taskloop_contracts::dto::BulkOperationResult;
use taskloop_contracts::{
    DlqEntry, DlqStatus, ExecutionRecord, HistoryFilters, ProgressEntry, ResultEntry, ScheduledJob, TaskEnvelope,
    TaskError, TaskStats, TaskStatus,
};
use taskloop_results::ResultBackend;
use taskloop_scheduler::Scheduler;
use taskloop_tracker::ExecutionTracker;
use taskloop_worker::{DeadLetterQueue, HandlerRegistry};
use uuid::Uuid;

/// Outcome of `cancel_task`, matching the `{cancelled, previous_status,
/// message}` shape returned by `POST /tasks/cancel` (§6). Cancellation of a
/// terminal task is a 200 with `cancelled:false`, never an error (§7).
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub cancelled: bool,
    pub previous_status: Option<TaskStatus>,
    pub message: String,
}

/// Outcome of `trigger_task`: the envelope that was published, so the
/// caller can report its fresh `task_id` without a round-trip to the
/// tracker (`trigger_task` seeds the pending row itself before publishing).
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub task_id: Uuid,
    pub task_name: String,
}

/// Outcome of `dlq_retry`: the original entry's id plus the freshly minted
/// envelope now in flight (§4.5 — retry never reuses the original id).
#[derive(Debug, Clone)]
pub struct DlqRetryOutcome {
    pub original_task_id: Uuid,
    pub new_task_id: Uuid,
    pub task_name: String,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub default_queue: String,
    pub default_max_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { default_queue: "default".to_string(), default_max_retries: 3 }
    }
}

/// Generalized from `TaskManagementService` in the source's
/// `features/tasks/service.py`: one façade over every collaborator C9
/// needs, so the HTTP layer never talks to the broker or tracker directly.
pub struct TaskManagementService {
    tracker: Arc<dyn ExecutionTracker>,
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultBackend>,
    dlq: Arc<dyn DeadLetterQueue>,
    scheduler: Arc<Scheduler>,
    registry: HandlerRegistry,
    config: ServiceConfig,
}

impl TaskManagementService {
    pub fn new(
        tracker: Arc<dyn ExecutionTracker>,
        broker: Arc<dyn Broker>,
        results: Arc<dyn ResultBackend>,
        dlq: Arc<dyn DeadLetterQueue>,
        scheduler: Arc<Scheduler>,
        registry: HandlerRegistry,
        config: ServiceConfig,
    ) -> Self {
        Self { tracker, broker, results, dlq, scheduler, registry, config }
    }

    // --- Tracker-backed queries -------------------------------------------------

    pub async fn search_tasks(&self, filters: &HistoryFilters, limit: i64, offset: i64) -> (Vec<ExecutionRecord>, i64) {
        let items = self.tracker.get_task_history(filters, limit, offset).await;
        let total = self.tracker.count_task_history(filters).await;
        (items, total)
    }

    pub async fn get_task_details(&self, task_id: Uuid) -> Option<ExecutionRecord> {
        self.tracker.get_task_details(task_id).await
    }

    /// Running records, each paired with `running_for_ms` computed against
    /// the current wall clock (§4.3's `get_running_tasks` annotation).
    pub async fn get_running_tasks(&self) -> Vec<(ExecutionRecord, i64)> {
        let now = Utc::now();
        self.tracker
            .get_running_tasks()
            .await
            .into_iter()
            .map(|r| {
                let running_for_ms = r.running_for_ms(now).unwrap_or(0);
                (r, running_for_ms)
            })
            .collect()
    }

    pub async fn get_stats(&self, window_hours: i64) -> TaskStats {
        self.tracker.get_stats(window_hours).await
    }

    /// Used by the HTTP control plane's `/health` endpoint (§4.8).
    pub fn tracker_connected(&self) -> bool {
        self.tracker.is_connected()
    }

    // --- Cancellation ------------------------------------------------------------

    pub async fn cancel_task(&self, task_id: Uuid, _reason: Option<String>) -> CancelOutcome {
        let previous = self.tracker.get_task_details(task_id).await;
        let previous_status = previous.as_ref().map(|r| r.status);

        match previous_status {
            None => CancelOutcome {
                cancelled: false,
                previous_status: None,
                message: format!("no execution record found for task {task_id}"),
            },
            Some(status) if status.is_terminal() => CancelOutcome {
                cancelled: false,
                previous_status: Some(status),
                message: format!("task {task_id} is already {status} and cannot be cancelled"),
            },
            Some(status) => {
                let cancelled = self.tracker.cancel_task(task_id).await;
                CancelOutcome {
                    cancelled,
                    previous_status: Some(status),
                    message: if cancelled {
                        format!("task {task_id} cancelled (was {status})")
                    } else {
                        format!("task {task_id} could not be cancelled (was {status})")
                    },
                }
            }
        }
    }

    // --- Triggering ---------------------------------------------------------------

    pub async fn trigger_task(&self, task_name: &str, params: Option<HashMap<String, Value>>) -> Result<TriggerOutcome, TaskError> {
        if !self.registry.contains(task_name) {
            return Err(TaskError::HandlerNotRegistered(task_name.to_string()));
        }

        let mut envelope = TaskEnvelope::new(task_name, self.config.default_queue.clone(), self.config.default_max_retries);
        envelope.kwargs = params.unwrap_or_default();

        self.tracker.record_pending(ExecutionRecord::pending(&envelope)).await;
        self.broker.submit(envelope.clone()).await?;

        Ok(TriggerOutcome { task_id: envelope.task_id, task_name: envelope.task_name })
    }

    // --- Scheduler passthroughs -----------------------------------------------

    pub async fn get_scheduled_jobs(&self) -> Vec<ScheduledJob> {
        self.scheduler.list_jobs().await
    }

    pub async fn get_scheduled_job(&self, job_id: &str) -> Option<ScheduledJob> {
        self.scheduler.get_job(job_id).await
    }

    pub async fn pause_job(&self, job_id: &str) -> bool {
        self.scheduler.pause(job_id).await
    }

    pub async fn resume_job(&self, job_id: &str) -> bool {
        self.scheduler.resume(job_id).await
    }

    // --- Dead-letter queue passthroughs -----------------------------------------

    pub async fn dlq_list(&self, limit: i64, offset: i64, status: Option<DlqStatus>) -> (Vec<DlqEntry>, i64) {
        self.dlq.list(limit, offset, status).await
    }

    pub async fn dlq_get(&self, task_id: Uuid) -> Option<DlqEntry> {
        self.dlq.get(task_id).await
    }

    pub async fn dlq_retry(&self, task_id: Uuid) -> Result<DlqRetryOutcome, TaskError> {
        let fresh = self.dlq.retry(task_id).await?;
        self.tracker.record_pending(ExecutionRecord::pending(&fresh)).await;
        self.broker.submit(fresh.clone()).await?;
        Ok(DlqRetryOutcome { original_task_id: task_id, new_task_id: fresh.task_id, task_name: fresh.task_name })
    }

    pub async fn dlq_discard(&self, task_id: Uuid, reason: Option<String>) -> Result<(), TaskError> {
        self.dlq.discard(task_id, reason).await
    }

    // --- Bulk operations -----------------------------------------------------------

    pub async fn bulk_cancel(&self, task_ids: &[Uuid], reason: Option<String>) -> Vec<BulkOperationResult> {
        let mut results = Vec::with_capacity(task_ids.len());
        for &task_id in task_ids {
            let outcome = self.cancel_task(task_id, reason.clone()).await;
            results.push(BulkOperationResult {
                task_id,
                success: outcome.cancelled,
                message: outcome.message,
                previous_status: outcome.previous_status,
            });
        }
        results
    }

    pub async fn bulk_retry_dlq(&self, task_ids: &[Uuid]) -> Vec<BulkOperationResult> {
        let mut results = Vec::with_capacity(task_ids.len());
        for &task_id in task_ids {
            match self.dlq_retry(task_id).await {
                Ok(outcome) => results.push(BulkOperationResult {
                    task_id,
                    success: true,
                    message: format!("requeued as {}", outcome.new_task_id),
                    previous_status: None,
                }),
                Err(e) => results.push(BulkOperationResult {
                    task_id,
                    success: false,
                    message: e.to_string(),
                    previous_status: None,
                }),
            }
        }
        results
    }

    // --- Result backend passthroughs ----------------------------------------------

    pub async fn get_result(&self, task_id: Uuid, keep: bool) -> Result<ResultEntry, TaskError> {
        self.results.get_result(task_id, keep).await
    }

    pub async fn get_progress(&self, task_id: Uuid) -> Result<Option<ProgressEntry>, TaskError> {
        self.results.get_progress(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use taskloop_broker::inmemory::InMemoryBroker;
    use taskloop_contracts::TriggerSpec;
    use taskloop_worker::{HandlerError, TaskContext, TaskHandler};

    struct NoopHandler;
    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn call(&self, _ctx: TaskContext) -> Result<Value, HandlerError> {
            Ok(Value::Null)
        }
    }

    #[derive(Default)]
    struct FakeTracker {
        cancel_calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ExecutionTracker for FakeTracker {
        async fn connect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
        async fn record_pending(&self, _: ExecutionRecord) {}
        async fn on_task_start(&self, _: Uuid, _: &str, _: taskloop_tracker::TaskStartEvent) {}
        async fn on_task_finish(
            &self,
            _: Uuid,
            _: TaskStatus,
            _: Option<Value>,
            _: Option<String>,
            _: Option<String>,
            _: Option<String>,
            _: i64,
        ) {
        }
        async fn cancel_task(&self, _: Uuid) -> bool {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn get_running_tasks(&self) -> Vec<ExecutionRecord> {
            Vec::new()
        }
        async fn get_task_history(&self, _: &HistoryFilters, _: i64, _: i64) -> Vec<ExecutionRecord> {
            Vec::new()
        }
        async fn count_task_history(&self, _: &HistoryFilters) -> i64 {
            0
        }
        async fn get_task_details(&self, task_id: Uuid) -> Option<ExecutionRecord> {
            Some(ExecutionRecord {
                task_id,
                task_name: "export_csv".to_string(),
                status: TaskStatus::Running,
                created_at: Utc::now(),
                started_at: Some(Utc::now()),
                finished_at: None,
                duration_ms: None,
                worker_id: None,
                queue_name: None,
                retry_count: 0,
                max_retries: 3,
                return_value: None,
                error_type: None,
                error_message: None,
                error_traceback: None,
                task_args: None,
                task_kwargs: None,
                labels: None,
                progress: None,
            })
        }
        async fn get_stats(&self, _: i64) -> TaskStats {
            TaskStats {
                total_count: 0,
                success_count: 0,
                failure_count: 0,
                running_count: 0,
                cancelled_count: 0,
                pending_count: 0,
                avg_duration_ms: None,
                by_task_name: HashMap::new(),
            }
        }
    }

    #[derive(Default)]
    struct FakeResultBackend;

    #[async_trait]
    impl ResultBackend for FakeResultBackend {
        async fn set_result(&self, _: Uuid, _: ResultEntry, _: taskloop_results::TtlSeconds) -> Result<(), TaskError> {
            Ok(())
        }
        async fn get_result(&self, task_id: Uuid, _: bool) -> Result<ResultEntry, TaskError> {
            Err(TaskError::ResultMissing(task_id))
        }
        async fn is_ready(&self, _: Uuid) -> Result<bool, TaskError> {
            Ok(false)
        }
        async fn set_progress(&self, _: Uuid, _: ProgressEntry, _: taskloop_results::TtlSeconds) -> Result<(), TaskError> {
            Ok(())
        }
        async fn get_progress(&self, _: Uuid) -> Result<Option<ProgressEntry>, TaskError> {
            Ok(None)
        }
    }

    fn fixture() -> (TaskManagementService, Arc<FakeTracker>) {
        let tracker = Arc::new(FakeTracker::default());
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let results: Arc<dyn ResultBackend> = Arc::new(FakeResultBackend);
        let dlq: Arc<dyn DeadLetterQueue> = Arc::new(taskloop_worker::InMemoryDeadLetterQueue::new());
        let scheduler = Arc::new(Scheduler::new(
            vec![ScheduledJob {
                job_id: "nightly".to_string(),
                job_name: "nightly".to_string(),
                handler_name: "cleanup_temp_files".to_string(),
                args: Vec::new(),
                kwargs: HashMap::new(),
                trigger_spec: TriggerSpec::Interval { period_seconds: 3600 },
                next_run_time: None,
                paused: false,
                misfire_grace_seconds: 60,
                max_instances: 1,
            }],
            broker.clone(),
            tracker.clone() as Arc<dyn ExecutionTracker>,
            "default",
        ));
        let mut registry = HandlerRegistry::new();
        registry.register("export_csv", Arc::new(NoopHandler));
        let service = TaskManagementService::new(
            tracker.clone() as Arc<dyn ExecutionTracker>,
            broker,
            results,
            dlq,
            scheduler,
            registry,
            ServiceConfig::default(),
        );
        (service, tracker)
    }

    #[tokio::test]
    async fn trigger_unregistered_handler_is_rejected() {
        let (service, _) = fixture();
        let err = service.trigger_task("not_registered", None).await.unwrap_err();
        assert!(matches!(err, TaskError::HandlerNotRegistered(_)));
    }

    #[tokio::test]
    async fn trigger_registered_handler_publishes() {
        let (service, _) = fixture();
        let outcome = service.trigger_task("export_csv", None).await.unwrap();
        assert_eq!(outcome.task_name, "export_csv");
    }

    #[tokio::test]
    async fn cancel_running_task_transitions() {
        let (service, tracker) = fixture();
        let outcome = service.cancel_task(Uuid::new_v4(), None).await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.previous_status, Some(TaskStatus::Running));
        assert_eq!(tracker.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bulk_cancel_reports_per_item() {
        let (service, _) = fixture();
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let results = service.bulk_cancel(&ids, None).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn scheduled_jobs_pass_through() {
        let (service, _) = fixture();
        let jobs = service.get_scheduled_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert!(service.pause_job("nightly").await);
        assert!(service.get_scheduled_job("nightly").await.unwrap().paused);
        assert!(service.resume_job("nightly").await);
        assert!(!service.get_scheduled_job("nightly").await.unwrap().paused);
    }
}
