use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// A completed handler outcome, keyed by `task_id` in the result backend.
/// Independent of the tracker row; never authoritative for `status`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResultEntry {
    Ok { value: Value, recorded_at: DateTime<Utc> },
    Err { error_type: String, message: String, recorded_at: DateTime<Utc> },
}

impl ResultEntry {
    pub fn ok(value: Value) -> Self {
        ResultEntry::Ok { value, recorded_at: Utc::now() }
    }

    pub fn err(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        ResultEntry::Err {
            error_type: error_type.into(),
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            ResultEntry::Ok { recorded_at, .. } => *recorded_at,
            ResultEntry::Err { recorded_at, .. } => *recorded_at,
        }
    }
}

/// Arbitrary JSON progress payload, overwritten on each update, sharing the
/// result entry's TTL.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProgressEntry {
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl ProgressEntry {
    pub fn new(payload: Value) -> Self {
        Self { payload, updated_at: Utc::now() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_and_err_constructors_stamp_recorded_at() {
        let ok = ResultEntry::ok(json!({"rows": 42}));
        assert!(matches!(ok, ResultEntry::Ok { .. }));
        assert!(ok.recorded_at() <= Utc::now());

        let err = ResultEntry::err("timeout", "handler exceeded its invocation timeout");
        match &err {
            ResultEntry::Err { error_type, message, .. } => {
                assert_eq!(error_type, "timeout");
                assert_eq!(message, "handler exceeded its invocation timeout");
            }
            _ => panic!("expected an Err variant"),
        }
    }

    #[test]
    fn result_entry_tags_the_outcome_field_on_the_wire() {
        let ok = ResultEntry::ok(json!(1));
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["outcome"], "ok");

        let err = ResultEntry::err("fatal", "boom");
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["outcome"], "err");
    }

    #[test]
    fn progress_entry_carries_the_payload_through() {
        let entry = ProgressEntry::new(json!({"percent": 50}));
        assert_eq!(entry.payload["percent"], 50);
    }
}
