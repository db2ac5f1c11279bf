use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use wayline_core::error::{CompilationError, WaylineError};

/// Engine error rendered as `{error_kind, message}`.
#[derive(Debug)]
pub struct ApiError(pub WaylineError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            WaylineError::ExecutionNotFound(_)
            | WaylineError::DefinitionNotFound { .. }
            | WaylineError::CheckpointNotFound { .. }
            | WaylineError::ApprovalNotFound(_) => StatusCode::NOT_FOUND,
            WaylineError::InvalidStateTransition { .. }
            | WaylineError::Compilation(CompilationError::VersionConflict { .. }) => {
                StatusCode::CONFLICT
            }
            WaylineError::Compilation(_) | WaylineError::InvalidDecision(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            WaylineError::Json(_) | WaylineError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<WaylineError> for ApiError {
    fn from(e: WaylineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = json!({
            "error_kind": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
