//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use stepflow_types::error::EngineError;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Engine taxonomy errors from lifecycle and callback operations.
    Engine(EngineError),
    /// Generic internal error.
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Engine(EngineError::PayloadNotValid(msg)) => {
                (StatusCode::BAD_REQUEST, "PAYLOAD_NOT_VALID", msg.clone())
            }
            AppError::Engine(EngineError::ResourceNotFound(msg)) => {
                (StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND", msg.clone())
            }
            AppError::Engine(EngineError::InternalService(msg)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVICE_ERROR",
                msg.clone(),
            ),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
