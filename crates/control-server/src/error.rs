//! Request-level errors and their JSON rendering

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lab_orchestrator::LabError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing bearer token")]
    Unauthorized,

    #[error("Invalid token")]
    Forbidden,

    #[error(transparent)]
    Lab(#[from] LabError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Lab(LabError::RuntimeUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Lab(LabError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Lab(LabError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Lab(LabError::Protected(_)) => StatusCode::FORBIDDEN,
            ApiError::Lab(LabError::Runtime(_)) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if matches!(self, ApiError::Lab(LabError::Runtime(_) | LabError::RuntimeUnavailable(_))) {
            error!(status = status.as_u16(), error = %self, "Request failed");
        }
        (
            status,
            Json(json!({
                "success": false,
                "error": self.to_string(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ApiError::Forbidden, StatusCode::FORBIDDEN),
            (
                LabError::RuntimeUnavailable("socket".into()).into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (LabError::NotFound("x".into()).into(), StatusCode::NOT_FOUND),
            (LabError::Validation("x".into()).into(), StatusCode::BAD_REQUEST),
            (LabError::Protected("db".into()).into(), StatusCode::FORBIDDEN),
            (LabError::Runtime("boom".into()).into(), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }

    #[test]
    fn test_message_passthrough() {
        let err: ApiError = LabError::Validation("Invalid action".into()).into();
        assert_eq!(err.to_string(), "Invalid action");
    }
}
