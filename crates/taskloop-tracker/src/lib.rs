// Execution tracker (C4): the authoritative index of every attempt. Two
// backends (KV-indexed, relational) behind one interface with identical
// semantics; see `kv.rs` and `postgres.rs`.

pub mod kv;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use taskloop_contracts::{ExecutionRecord, HistoryFilters, TaskStats, TaskStatus};
use uuid::Uuid;

pub use kv::RedisTracker;
pub use postgres::PostgresTracker;

/// Arguments to `on_task_start`, grouped because every backend needs the
/// same bag of optional fields and the trait method would otherwise take
/// seven positional parameters.
#[derive(Debug, Clone, Default)]
pub struct TaskStartEvent {
    pub worker_id: Option<String>,
    pub queue_name: Option<String>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<HashMap<String, Value>>,
    pub labels: Option<HashMap<String, Value>>,
    pub max_retries: u32,
    pub retry_count: u32,
}

/// Authoritative index of execution attempts. Every method except
/// `connect` absorbs its own backend errors and logs rather than
/// propagating, per §4.3's failure semantics: a tracker outage must not
/// fail the underlying task.
#[async_trait]
pub trait ExecutionTracker: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;

    /// Seeds a `pending` row at submit time, before any worker consumes the
    /// envelope, so `cancel_task`/`get_task_details` observe the task the
    /// moment it's triggered rather than only after `on_task_start` (§8
    /// scenario 2). A no-op if a row already exists for this `task_id`.
    async fn record_pending(&self, record: ExecutionRecord);

    /// Idempotent upsert: if the record is non-terminal, updates
    /// worker/queue and flips to `running`; if terminal (including
    /// `cancelled`), no-op.
    async fn on_task_start(&self, task_id: Uuid, task_name: &str, event: TaskStartEvent);

    /// Transitions `running -> status`. No-op if the current status is
    /// already terminal (last writer does not win over cancellation).
    async fn on_task_finish(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        return_value: Option<Value>,
        error_type: Option<String>,
        error_message: Option<String>,
        error_traceback: Option<String>,
        duration_ms: i64,
    );

    /// Transitions `pending|running -> cancelled`. Returns `true` only if
    /// the transition occurred.
    async fn cancel_task(&self, task_id: Uuid) -> bool;

    async fn get_running_tasks(&self) -> Vec<ExecutionRecord>;

    /// Newest-first, ties broken by `task_id` ascending.
    async fn get_task_history(&self, filters: &HistoryFilters, limit: i64, offset: i64) -> Vec<ExecutionRecord>;

    async fn count_task_history(&self, filters: &HistoryFilters) -> i64;

    async fn get_task_details(&self, task_id: Uuid) -> Option<ExecutionRecord>;

    async fn get_stats(&self, window_hours: i64) -> TaskStats;
}

pub fn duration_ms(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> i64 {
    (finished_at - started_at).num_milliseconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_ms_computes_the_millisecond_delta() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(250);
        assert_eq!(duration_ms(start, end), 250);
    }

    #[test]
    fn duration_ms_clamps_negative_deltas_to_zero() {
        let start = Utc::now();
        let end = start - chrono::Duration::milliseconds(250);
        assert_eq!(duration_ms(start, end), 0);
    }
}
