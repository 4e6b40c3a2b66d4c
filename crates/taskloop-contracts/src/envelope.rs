use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

/// The unit that flows through the broker: identity, inputs, and routing.
///
/// `task_id` is immutable and unique across all live and historical
/// envelopes within retention. Retrying a failed envelope mints a fresh
/// `task_id` rather than reusing this one (see `taskloop-worker::dlq`).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: HashMap<String, Value>,
    #[serde(default)]
    pub labels: HashMap<String, Value>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub queue_name: String,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Builds a new envelope with a fresh id, zero retries, and `enqueued_at = now`.
    pub fn new(task_name: impl Into<String>, queue_name: impl Into<String>, max_retries: u32) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            task_name: task_name.into(),
            args: Vec::new(),
            kwargs: HashMap::new(),
            labels: HashMap::new(),
            retry_count: 0,
            max_retries,
            queue_name: queue_name.into(),
            enqueued_at: Utc::now(),
        }
    }

    /// Builds a retry envelope: same name/queue/args/kwargs/labels, fresh id,
    /// `retry_count` carried over (the worker increments it before
    /// republishing; the DLQ's `retry` does not since it starts a new chain).
    pub fn with_fresh_id(&self) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn job_id_label(&self) -> Option<&str> {
        self.labels.get("job_id").and_then(|v| v.as_str())
    }
}
