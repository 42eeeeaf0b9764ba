use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::assets::AssetError;
use crate::playback::session::SessionError;

pub mod files;
pub mod playback;

/// Standard error response format.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,

    #[serde(rename = "type")]
    pub error_type: String,
}

/// Error returned by the HTTP handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    error_type: &'static str,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            error_type: "not_found_error",
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        let (status, error_type) = match &error {
            SessionError::MissingSource => (StatusCode::SERVICE_UNAVAILABLE, "unavailable_error"),
            SessionError::Asset(AssetError::NotFound { .. }) => (StatusCode::NOT_FOUND, "not_found_error"),
            SessionError::Asset(AssetError::InvalidName { .. }) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            SessionError::Asset(AssetError::Io { .. }) | SessionError::Join(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        };

        Self {
            status,
            message: error.to_string(),
            error_type,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.message,
                error_type: self.error_type.to_string(),
            },
        };

        (self.status, Json(body)).into_response()
    }
}
