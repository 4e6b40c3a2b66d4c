use crate::context::TaskContext;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a failed handler invocation. `retryable` is a per-handler
/// judgment call (a validation error is never retryable; a downstream
/// timeout usually is) rather than a blanket retry-on-any-error policy.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub error_type: String,
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn fatal(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self { error_type: error_type.into(), message: message.into(), retryable: false }
    }

    pub fn retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self { error_type: error_type.into(), message: message.into(), retryable: true }
    }

    pub fn timeout() -> Self {
        Self { error_type: "timeout".to_string(), message: "handler exceeded its invocation timeout".to_string(), retryable: true }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// A registered piece of business logic, opaque to the worker beyond its
/// name (§1 Non-goals: concrete task logic is external to the core).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, ctx: TaskContext) -> Result<Value, HandlerError>;

    /// Per-invocation timeout. Handlers with long-running work override this;
    /// the default matches the worker's configured default.
    fn timeout_seconds(&self) -> u64 {
        30
    }
}

/// Static name-to-handler lookup populated at startup. Triggering or
/// consuming an envelope with no matching entry is a
/// `TaskError::HandlerNotRegistered`, never a panic.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_name.into(), handler);
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_name).cloned()
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.handlers.contains_key(task_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn call(&self, _ctx: TaskContext) -> Result<Value, HandlerError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn handler_error_constructors_set_retryable() {
        assert!(!HandlerError::fatal("bad_input", "missing field").retryable);
        assert!(HandlerError::retryable("downstream_timeout", "upstream slow").retryable);
        assert!(HandlerError::timeout().retryable);
        assert_eq!(HandlerError::timeout().error_type, "timeout");
    }

    #[test]
    fn registry_contains_and_get_agree() {
        let mut registry = HandlerRegistry::new();
        assert!(!registry.contains("export_csv"));
        assert!(registry.get("export_csv").is_none());

        registry.register("export_csv", Arc::new(NoopHandler));
        assert!(registry.contains("export_csv"));
        assert!(registry.get("export_csv").is_some());
        assert!(registry.get("export_json").is_none());
    }

    #[test]
    fn default_handler_timeout_is_thirty_seconds() {
        assert_eq!(NoopHandler.timeout_seconds(), 30);
    }
}
