use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Retried,
    Discarded,
}

impl std::fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DlqStatus::Pending => "pending",
            DlqStatus::Retried => "retried",
            DlqStatus::Discarded => "discarded",
        };
        write!(f, "{s}")
    }
}

impl FromStr for DlqStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DlqStatus::Pending),
            "retried" => Ok(DlqStatus::Retried),
            "discarded" => Ok(DlqStatus::Discarded),
            other => Err(format!("unknown dlq status: {other}")),
        }
    }
}

/// A terminally-failed envelope captured for inspection, retry, or discard.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DlqEntry {
    pub task_id: Uuid,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
    pub labels: HashMap<String, Value>,
    pub queue_name: String,
    pub error_type: String,
    pub error_message: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub status: DlqStatus,
    pub discard_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_status_round_trips_through_display_and_from_str() {
        for status in [DlqStatus::Pending, DlqStatus::Retried, DlqStatus::Discarded] {
            assert_eq!(status.to_string().parse::<DlqStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<DlqStatus>().is_err());
    }
}
