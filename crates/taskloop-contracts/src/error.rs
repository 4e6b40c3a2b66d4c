use uuid::Uuid;

/// Error taxonomy shared across the broker, tracker, result backend, worker,
/// and service layers. HTTP status mapping lives in `taskloop-api`, not
/// here, so this crate stays framework-agnostic.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("tracker unavailable: {0}")]
    TrackerUnavailable(String),

    #[error("no result for task {0}")]
    ResultMissing(Uuid),

    #[error("no handler registered for task name '{0}'")]
    HandlerNotRegistered(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("task {0} is not cancellable (status: {1})")]
    NotCancellable(Uuid, String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("dlq entry {0} not found")]
    DlqEntryNotFound(Uuid),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    pub fn broker_unavailable(msg: impl Into<String>) -> Self {
        TaskError::BrokerUnavailable(msg.into())
    }

    pub fn tracker_unavailable(msg: impl Into<String>) -> Self {
        TaskError::TrackerUnavailable(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        TaskError::Validation(msg.into())
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_build_the_expected_variant() {
        assert!(matches!(TaskError::broker_unavailable("down"), TaskError::BrokerUnavailable(msg) if msg == "down"));
        assert!(matches!(TaskError::tracker_unavailable("down"), TaskError::TrackerUnavailable(msg) if msg == "down"));
        assert!(matches!(TaskError::validation("bad"), TaskError::Validation(msg) if msg == "bad"));
    }

    #[test]
    fn internal_wraps_an_anyhow_error_via_from() {
        let source: anyhow::Error = anyhow::anyhow!("boom");
        let err: TaskError = source.into();
        assert!(matches!(err, TaskError::Internal(_)));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn display_messages_include_the_offending_identifier() {
        let task_id = Uuid::new_v4();
        let err = TaskError::ResultMissing(task_id);
        assert!(err.to_string().contains(&task_id.to_string()));

        let err = TaskError::NotCancellable(task_id, "success".to_string());
        assert!(err.to_string().contains("success"));
    }
}
