//! Mapping from core error kinds to HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{debug, error, warn};

use foreman_core::Error;

/// Wrapper giving [`foreman_core::Error`] an HTTP shape.
///
/// 4xx bodies carry the error message; 5xx bodies never leak detail.
pub struct ApiError(pub Error);

impl ApiError {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self(Error::Unauthenticated(msg.into()))
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self.0 {
            Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            Error::InvalidTransition(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            Error::Conflict(_) => (StatusCode::CONFLICT, self.0.to_string()),
            Error::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, self.0.to_string()),
            Error::Forbidden(_) => (StatusCode::FORBIDDEN, self.0.to_string()),
            Error::Internal(cause) => {
                error!(error = ?cause, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_owned(),
                )
            }
        };

        match &self.0 {
            Error::InvalidInput(_) => debug!(kind = self.0.kind(), %message, "request rejected"),
            Error::Internal(_) => {}
            _ => warn!(kind = self.0.kind(), %message, "request failed"),
        }

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
