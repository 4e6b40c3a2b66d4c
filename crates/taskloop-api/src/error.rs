// Maps `TaskError` (framework-agnostic, defined in `taskloop-contracts`) to
// HTTP responses per the code table in §7. One `IntoResponse` impl here
// instead of a `map_err` at every handler, mirroring `AuthError` in the
// teacher's auth middleware.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use taskloop_contracts::dto::{ValidationErrorDetail, ValidationErrorResponse};
use taskloop_contracts::TaskError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

/// Newtype so `IntoResponse` can be implemented here without running afoul
/// of the orphan rule (`TaskError` lives in `taskloop-contracts`).
pub struct ApiError(pub TaskError);

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            TaskError::BrokerUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, ErrorBody::new(self.0.to_string())),
            TaskError::TrackerUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, ErrorBody::new(self.0.to_string())),
            TaskError::ResultMissing(_) => (StatusCode::NOT_FOUND, ErrorBody::new(self.0.to_string())),
            TaskError::HandlerNotRegistered(_) => (StatusCode::UNPROCESSABLE_ENTITY, ErrorBody::new(self.0.to_string())),
            TaskError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, ErrorBody::new(self.0.to_string())),
            TaskError::NotCancellable(_, _) => (StatusCode::OK, ErrorBody::new(self.0.to_string())),
            TaskError::JobNotFound(_) => (StatusCode::NOT_FOUND, ErrorBody::new(self.0.to_string())),
            TaskError::DlqEntryNotFound(_) => (StatusCode::NOT_FOUND, ErrorBody::new(self.0.to_string())),
            TaskError::Internal(_) => {
                tracing::error!(error = %self.0, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorBody::new("internal server error"))
            }
        };
        (status, Json(body)).into_response()
    }
}

/// 422 with field-level detail, for request validation done at the HTTP
/// boundary before anything reaches `taskloop-service` (§6's validation
/// table).
pub struct ValidationFailure(pub Vec<(String, String)>);

impl IntoResponse for ValidationFailure {
    fn into_response(self) -> Response {
        let detail = self.0.into_iter().map(|(field, message)| ValidationErrorDetail { field, message }).collect();
        (StatusCode::UNPROCESSABLE_ENTITY, Json(ValidationErrorResponse { detail })).into_response()
    }
}
