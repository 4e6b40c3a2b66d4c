use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Status of a single execution attempt. Transitions form a strict DAG:
/// `pending -> running -> {success|failure|cancelled}`, plus
/// `pending -> cancelled`. No transition leaves a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled)
    }

    /// Whether `self -> next` is an allowed transition per the DAG in §3/§4.3.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Pending, Cancelled) => true,
            (Running, Success) => true,
            (Running, Failure) => true,
            (Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// The tracker's authoritative row for one `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExecutionRecord {
    pub task_id: Uuid,
    pub task_name: String,
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,

    pub worker_id: Option<String>,
    pub queue_name: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,

    pub return_value: Option<Value>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,

    pub task_args: Option<Vec<Value>>,
    pub task_kwargs: Option<HashMap<String, Value>>,
    pub labels: Option<HashMap<String, Value>>,

    pub progress: Option<Value>,
}

impl ExecutionRecord {
    /// A freshly-pending record for `task_id`, as created the first time a
    /// task is seen (before `on_task_start`). Components build this, never
    /// construct it field-by-field at call sites.
    pub fn pending(envelope: &crate::envelope::TaskEnvelope) -> Self {
        Self {
            task_id: envelope.task_id,
            task_name: envelope.task_name.clone(),
            status: TaskStatus::Pending,
            created_at: envelope.enqueued_at,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            worker_id: None,
            queue_name: Some(envelope.queue_name.clone()),
            retry_count: envelope.retry_count,
            max_retries: envelope.max_retries,
            return_value: None,
            error_type: None,
            error_message: None,
            error_traceback: None,
            task_args: Some(envelope.args.clone()),
            task_kwargs: Some(envelope.kwargs.clone()),
            labels: Some(envelope.labels.clone()),
            progress: None,
        }
    }

    pub fn running_for_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.started_at.map(|s| (now - s).num_milliseconds())
    }
}

/// Filter grammar shared by `get_task_history` / `count_task_history` across
/// both tracker backends. Every field is an optional exact/range bound.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct HistoryFilters {
    pub task_name: Option<String>,
    /// Partial, case-insensitive match against `task_name` (supplemental to
    /// the exact-match grammar in the original spec; dropped by the
    /// distillation but present in the source's search endpoint).
    pub task_name_like: Option<String>,
    pub status: Option<TaskStatus>,
    /// Multi-value status filter, OR'd together (source: `statuses` param).
    pub statuses: Option<Vec<TaskStatus>>,
    pub worker_id: Option<String>,
    pub error_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
}

impl HistoryFilters {
    /// True when any filter beyond a single indexed field (`task_name` xor
    /// `status`) is present — used by the KV backend to decide the
    /// over-fetch multiplier (§4.3 KV history algorithm).
    pub fn has_secondary_filters(&self) -> bool {
        self.task_name_like.is_some()
            || self.statuses.is_some()
            || self.worker_id.is_some()
            || self.error_type.is_some()
            || self.created_after.is_some()
            || self.created_before.is_some()
            || self.min_duration_ms.is_some()
            || self.max_duration_ms.is_some()
    }

    /// Applies every filter to a single record in memory. Used by the KV
    /// backend after fetching candidate hashes, and by the in-memory test
    /// fakes; the relational backend pushes these down into SQL instead.
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(name) = &self.task_name {
            if &record.task_name != name {
                return false;
            }
        }
        if let Some(pat) = &self.task_name_like {
            if !record.task_name.to_lowercase().contains(&pat.to_lowercase()) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&record.status) {
                return false;
            }
        }
        if let Some(worker_id) = &self.worker_id {
            if record.worker_id.as_deref() != Some(worker_id.as_str()) {
                return false;
            }
        }
        if let Some(error_type) = &self.error_type {
            if record.error_type.as_deref() != Some(error_type.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at > before {
                return false;
            }
        }
        if let Some(min_ms) = self.min_duration_ms {
            if record.duration_ms.map(|d| d < min_ms).unwrap_or(true) {
                return false;
            }
        }
        if let Some(max_ms) = self.max_duration_ms {
            if record.duration_ms.map(|d| d > max_ms).unwrap_or(true) {
                return false;
            }
        }
        true
    }
}

/// Aggregate counters returned by `get_stats(window_hours)`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskStats {
    pub total_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub running_count: i64,
    pub cancelled_count: i64,
    pub pending_count: i64,
    pub avg_duration_ms: Option<f64>,
    pub by_task_name: HashMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::TaskEnvelope;

    #[test]
    fn status_transitions_form_the_documented_dag() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Success));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failure));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Success));
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn terminal_statuses_are_exactly_the_dag_sinks() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failure.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_round_trips_through_display_and_from_str() {
        for status in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Success, TaskStatus::Failure, TaskStatus::Cancelled] {
            let s = status.to_string();
            assert_eq!(s.parse::<TaskStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn pending_record_carries_envelope_fields() {
        let envelope = TaskEnvelope::new("export_csv", "default", 3);
        let record = ExecutionRecord::pending(&envelope);
        assert_eq!(record.task_id, envelope.task_id);
        assert_eq!(record.task_name, "export_csv");
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(record.started_at.is_none());
        assert_eq!(record.queue_name.as_deref(), Some("default"));
    }

    #[test]
    fn running_for_ms_is_none_until_started() {
        let envelope = TaskEnvelope::new("export_csv", "default", 3);
        let mut record = ExecutionRecord::pending(&envelope);
        assert!(record.running_for_ms(Utc::now()).is_none());

        let started = Utc::now();
        record.started_at = Some(started);
        let later = started + chrono::Duration::milliseconds(500);
        assert_eq!(record.running_for_ms(later), Some(500));
    }

    fn sample_record(task_name: &str, status: TaskStatus, duration_ms: Option<i64>) -> ExecutionRecord {
        let envelope = TaskEnvelope::new(task_name, "default", 3);
        let mut record = ExecutionRecord::pending(&envelope);
        record.status = status;
        record.duration_ms = duration_ms;
        record
    }

    #[test]
    fn history_filters_match_on_exact_name_and_status() {
        let filters = HistoryFilters { task_name: Some("export_csv".to_string()), status: Some(TaskStatus::Success), ..Default::default() };
        assert!(filters.matches(&sample_record("export_csv", TaskStatus::Success, Some(10))));
        assert!(!filters.matches(&sample_record("export_json", TaskStatus::Success, Some(10))));
        assert!(!filters.matches(&sample_record("export_csv", TaskStatus::Failure, Some(10))));
    }

    #[test]
    fn history_filters_duration_bounds_reject_missing_duration() {
        let filters = HistoryFilters { min_duration_ms: Some(100), ..Default::default() };
        assert!(!filters.matches(&sample_record("export_csv", TaskStatus::Pending, None)));
        assert!(filters.matches(&sample_record("export_csv", TaskStatus::Success, Some(150))));
        assert!(!filters.matches(&sample_record("export_csv", TaskStatus::Success, Some(50))));
    }

    #[test]
    fn has_secondary_filters_ignores_the_primary_indexed_fields() {
        let primary_only = HistoryFilters { task_name: Some("export_csv".to_string()), status: Some(TaskStatus::Success), ..Default::default() };
        assert!(!primary_only.has_secondary_filters());

        let with_secondary = HistoryFilters { worker_id: Some("worker-1".to_string()), ..Default::default() };
        assert!(with_secondary.has_secondary_filters());
    }
}
