use std::sync::Arc;
use taskloop_service::TaskManagementService;

/// Shared state for every route group, mirroring the teacher's per-module
/// `AppState { db: Arc<Database> }` convention — one `Arc` handle cloned
/// cheaply into each router merge.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TaskManagementService>,
}

impl AppState {
    pub fn new(service: Arc<TaskManagementService>) -> Self {
        Self { service }
    }
}
