// Worker loop & middleware (C5) and dead-letter queue (C6). Consumes
// envelopes from the broker, invokes the registered handler, and drives the
// tracker/result/DLQ middleware chain around it.

pub mod context;
pub mod dlq;
pub mod registry;

use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use taskloop_broker::Broker;
use taskloop_contracts::{ExecutionRecord, ResultEntry, TaskEnvelope, TaskStatus};
use taskloop_results::ResultBackend;
use taskloop_tracker::{ExecutionTracker, TaskStartEvent};
use tokio::sync::Semaphore;

pub use context::TaskContext;
pub use dlq::{DeadLetterQueue, InMemoryDeadLetterQueue, PostgresDeadLetterQueue};
pub use registry::{HandlerError, HandlerRegistry, TaskHandler};

/// Backoff applied before republishing a retried envelope, indexed by the
/// attempt number about to be made (`retry_count` after incrementing).
/// Clamped to the last entry for retry counts beyond the table.
pub const RETRY_BACKOFF_SECONDS: &[u64] = &[1, 5, 15, 60, 300];

fn retry_delay(retry_count: u32) -> std::time::Duration {
    let idx = (retry_count as usize).min(RETRY_BACKOFF_SECONDS.len() - 1);
    std::time::Duration::from_secs(RETRY_BACKOFF_SECONDS[idx])
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub concurrency: usize,
    pub prefetch: u16,
    pub default_timeout_seconds: u64,
    pub result_ttl_seconds: Option<i64>,
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            concurrency: 4,
            prefetch: 8,
            default_timeout_seconds: 30,
            result_ttl_seconds: Some(86_400),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }
}

pub struct Worker {
    broker: Arc<dyn Broker>,
    tracker: Arc<dyn ExecutionTracker>,
    results: Arc<dyn ResultBackend>,
    dlq: Arc<dyn DeadLetterQueue>,
    registry: HandlerRegistry,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        tracker: Arc<dyn ExecutionTracker>,
        results: Arc<dyn ResultBackend>,
        dlq: Arc<dyn DeadLetterQueue>,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self { broker, tracker, results, dlq, registry, config }
    }

    /// Runs until the delivery stream ends (broker shutdown) or the process
    /// is terminated. Each delivery is handled on its own logical task,
    /// bounded by a semaphore sized to `concurrency` (§5).
    pub async fn run(self: Arc<Self>) -> Result<(), taskloop_contracts::TaskError> {
        let mut stream = self.broker.consume(&self.config.queue_name, self.config.prefetch).await?;
        let permits = Arc::new(Semaphore::new(self.config.concurrency));

        while let Some(delivery) = stream.next().await {
            let (envelope, ack) = match delivery {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "broker delivery error");
                    continue;
                }
            };

            let permit = permits.clone().acquire_owned().await.expect("semaphore never closed");
            let worker = self.clone();
            tokio::spawn(async move {
                worker.handle_one(envelope, ack).await;
                drop(permit);
            });
        }

        Ok(())
    }

    async fn handle_one(&self, envelope: TaskEnvelope, ack: Box<dyn taskloop_broker::AckHandle>) {
        let task_id = envelope.task_id;

        self.tracker
            .on_task_start(
                task_id,
                &envelope.task_name,
                TaskStartEvent {
                    worker_id: Some(self.config.worker_id.clone()),
                    queue_name: Some(envelope.queue_name.clone()),
                    args: Some(envelope.args.clone()),
                    kwargs: Some(envelope.kwargs.clone()),
                    labels: Some(envelope.labels.clone()),
                    max_retries: envelope.max_retries,
                    retry_count: envelope.retry_count,
                },
            )
            .await;

        // A pending->cancelled transition that landed before delivery:
        // the tracker row is already terminal, so skip the handler entirely.
        if let Some(record) = self.tracker.get_task_details(task_id).await {
            if record.status == TaskStatus::Cancelled {
                let _ = ack.ack().await;
                return;
            }
        }

        let Some(handler) = self.registry.get(&envelope.task_name) else {
            tracing::error!(task_name = %envelope.task_name, "no handler registered");
            self.fail_and_route(&envelope, "handler_not_registered", "no handler registered for this task name", false)
                .await;
            let _ = ack.ack().await;
            return;
        };

        let ctx = TaskContext::new(
            task_id,
            envelope.task_name.clone(),
            envelope.args.clone(),
            envelope.kwargs.clone(),
            envelope.labels.clone(),
            envelope.retry_count,
            self.results.clone(),
            self.tracker.clone(),
            self.config.result_ttl_seconds,
        );

        let started_at = Utc::now();
        let timeout = std::time::Duration::from_secs(handler.timeout_seconds().max(1));
        let outcome = tokio::time::timeout(timeout, handler.call(ctx)).await;

        let duration_ms = taskloop_tracker::duration_ms(started_at, Utc::now());

        match outcome {
            Ok(Ok(value)) => {
                if let Err(e) = self.results.set_result(task_id, ResultEntry::ok(value), self.config.result_ttl_seconds).await {
                    tracing::warn!(task_id = %task_id, error = %e, "failed to write result");
                }
                self.tracker
                    .on_task_finish(task_id, TaskStatus::Success, None, None, None, None, duration_ms)
                    .await;
                let _ = ack.ack().await;
            }
            Ok(Err(handler_err)) => {
                self.on_handler_failure(&envelope, handler_err, duration_ms).await;
                let _ = ack.ack().await;
            }
            Err(_elapsed) => {
                self.on_handler_failure(&envelope, HandlerError::timeout(), duration_ms).await;
                let _ = ack.ack().await;
            }
        }
    }

    async fn on_handler_failure(&self, envelope: &TaskEnvelope, err: HandlerError, duration_ms: i64) {
        if let Err(e) = self
            .results
            .set_result(envelope.task_id, ResultEntry::err(err.error_type.clone(), err.message.clone()), self.config.result_ttl_seconds)
            .await
        {
            tracing::warn!(task_id = %envelope.task_id, error = %e, "failed to write error result");
        }
        self.tracker
            .on_task_finish(
                envelope.task_id,
                TaskStatus::Failure,
                None,
                Some(err.error_type.clone()),
                Some(err.message.clone()),
                None,
                duration_ms,
            )
            .await;

        self.fail_and_route(envelope, &err.error_type, &err.message, err.retryable).await;
    }

    async fn fail_and_route(&self, envelope: &TaskEnvelope, error_type: &str, error_message: &str, retryable: bool) {
        if retryable && envelope.retry_count < envelope.max_retries {
            let mut retried = envelope.clone();
            retried.retry_count += 1;
            let delay = retry_delay(retried.retry_count);
            let broker = self.broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = broker.submit(retried).await {
                    tracing::error!(error = %e, "failed to republish retried envelope");
                }
            });
            return;
        }

        if let Err(e) = self.dlq.record(envelope, error_type, error_message).await {
            tracing::error!(task_id = %envelope.task_id, error = %e, "failed to record dlq entry");
        }
    }
}

/// Seeds a fresh `pending` tracker row the moment an envelope is accepted
/// for submission, before it ever reaches a worker. Callers (the service
/// layer, the scheduler) use this so `get_task_details` never 404s for a
/// task that is merely queued.
pub fn pending_record(envelope: &TaskEnvelope) -> ExecutionRecord {
    ExecutionRecord::pending(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_follows_the_backoff_table() {
        assert_eq!(retry_delay(0), std::time::Duration::from_secs(1));
        assert_eq!(retry_delay(1), std::time::Duration::from_secs(5));
        assert_eq!(retry_delay(4), std::time::Duration::from_secs(300));
    }

    #[test]
    fn retry_delay_clamps_beyond_the_table() {
        assert_eq!(retry_delay(100), std::time::Duration::from_secs(300));
    }

    #[test]
    fn pending_record_is_pending_and_untouched() {
        let envelope = TaskEnvelope::new("export_csv", "default", 3);
        let record = pending_record(&envelope);
        assert_eq!(record.task_id, envelope.task_id);
        assert_eq!(record.status, taskloop_contracts::TaskStatus::Pending);
        assert!(record.finished_at.is_none());
    }

    #[test]
    fn worker_config_default_matches_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.queue_name, "default");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.prefetch, 8);
        assert_eq!(config.default_timeout_seconds, 30);
        assert_eq!(config.result_ttl_seconds, Some(86_400));
    }
}
