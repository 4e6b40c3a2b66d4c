use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use utoipa::ToSchema;

/// Tagged trigger kind for a scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    Cron { expr: String },
    Interval { period_seconds: i64 },
    Date { at: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScheduledJob {
    pub job_id: String,
    pub job_name: String,
    pub handler_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: HashMap<String, Value>,
    pub trigger_spec: TriggerSpec,
    pub next_run_time: Option<DateTime<Utc>>,
    pub paused: bool,
    pub misfire_grace_seconds: i64,
    pub max_instances: u32,
}
