use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chime_scheduler::SchedulerError;
use serde::Serialize;
use tracing::warn;

/// Error body: `{"error": "NOT_FOUND", "message": "..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

/// A management error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::InvalidSchedule(_)
        | SchedulerError::InvalidHandler(_)
        | SchedulerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SchedulerError::NotFound { .. } => StatusCode::NOT_FOUND,
        SchedulerError::AlreadyExists { .. } | SchedulerError::Conflict { .. } => {
            StatusCode::CONFLICT
        }
        SchedulerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(code = self.0.code(), "request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
