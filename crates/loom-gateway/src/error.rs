//! HTTP mapping of request failures that happen before a response body is chosen.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use loom_core::LoomError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Caller lacks the required project role.
    #[error("{0}")]
    Forbidden(String),

    /// Body could not be read or failed validation.
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(LoomError),
}

impl From<LoomError> for ApiError {
    fn from(err: LoomError) -> Self {
        match err {
            LoomError::Access(message) => ApiError::Forbidden(message),
            LoomError::InvalidRequest(message) => ApiError::BadRequest(message),
            other => ApiError::Engine(other),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Forbidden(message) => (StatusCode::FORBIDDEN, json!({ "error": message })),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "success": false, "error": message }),
            ),
            ApiError::Engine(err) => {
                tracing::error!(target: "loom::gateway", error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "success": false, "error": err.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_maps_to_forbidden() {
        let err = ApiError::from(LoomError::Access("editor role required".into()));
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn invalid_request_maps_to_bad_request() {
        let err = ApiError::from(LoomError::InvalidRequest("no agents".into()));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn other_engine_errors_are_internal() {
        let err = ApiError::from(LoomError::Config("GEMINI_API_KEY is not set".into()));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
